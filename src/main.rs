use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Error, Result};
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use events_service::{
    api::run_api_server,
    clients::{
        database::Database,
        rbmq::{connect_broker, declare_topology},
    },
    config::Config,
    daemons::{
        retry::{RetryDaemon, RetryStats},
        scheduler::SchedulerDaemon,
    },
    schedules::{reminders::ReminderSource, transitions::StatusTransitionSource},
    utils::retry_with_backoff,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;

    init_tracing(&config);

    info!("Starting events service");

    let retry_config = config.retry_config();

    let connection = retry_with_backoff(&retry_config, || connect_broker(&config.rabbitmq_url))
        .await
        .context("RabbitMQ unreachable")?;

    let channel = connection.create_channel().await?;
    declare_topology(&channel, &config.topology()).await?;
    channel.close(200, "topology declared").await?;
    connection.close(200, "topology declared").await?;

    if config.run_migrations {
        let db = retry_with_backoff(&retry_config, || Database::connect(&config.database_url))
            .await
            .context("PostgreSQL unreachable")?;
        db.apply_schema().await?;
        db.close();
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let retry_stats = Arc::new(RetryStats::new(config.retry_failure_threshold));

    let reminders = SchedulerDaemon::new(&config, ReminderSource, shutdown.clone()).await?;
    let transitions = SchedulerDaemon::new(&config, StatusTransitionSource, shutdown.clone()).await?;
    let retries = RetryDaemon::new(&config, retry_stats.clone(), shutdown.clone()).await?;

    let mut daemons: Vec<JoinHandle<()>> = vec![
        tokio::spawn(reminders.run()),
        tokio::spawn(transitions.run()),
        tokio::spawn(retries.run()),
    ];

    let api_config = config.clone();
    let api_stats = retry_stats.clone();
    tokio::spawn(async move {
        if let Err(e) = run_api_server(api_config, api_stats).await {
            error!(error = %e, "Health server exited");
        }
    });

    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received");
    shutdown.store(true, Ordering::Relaxed);

    // Daemons notice the flag at their next iteration; ones parked in a
    // long wait are aborted after the grace period and release their
    // connections on drop.
    for task in &mut daemons {
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut *task).await.is_err() {
            task.abort();
        }
    }

    info!("Events service stopped");

    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
