use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;

use anyhow::{Result, anyhow};
use events_service::{
    clients::rbmq::{EventConsumer, EventPublisher, connect_broker, declare_topology},
    config::Config,
    models::event::{Event, EventType},
};
use lapin::{
    BasicProperties, Channel,
    options::{BasicPublishOptions, QueueDeclareOptions, QueuePurgeOptions},
    types::FieldTable,
};
use tokio::time::sleep;

/// Test: The consumer acks poison and failed deliveries and keeps consuming
#[tokio::test]
async fn test_consumer_acks_poison_and_failed_deliveries() -> Result<()> {
    let config = match load_config() {
        Some(config) => config,
        None => return Ok(()),
    };

    let connection = connect_broker(&config.rabbitmq_url).await?;
    let channel = connection.create_channel().await?;
    declare_topology(&channel, &config.topology()).await?;
    channel
        .queue_purge("notifications", QueuePurgeOptions::default())
        .await?;

    let handled = Arc::new(AtomicUsize::new(0));
    let seen = handled.clone();

    let mut consumer = EventConsumer::connect(&config, "notifications").await?;
    consumer.bind("notification_due").await?;
    consumer.register_handler(EventType::NotificationDue, move |_event| {
        let seen = seen.clone();
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("handler rejected event"))
        }
    });
    let consumer_task = consumer.start_consuming();

    // Not JSON at all. The consumer must ack it and keep going.
    channel
        .basic_publish(
            "",
            "notifications",
            BasicPublishOptions::default(),
            b"not an event",
            BasicProperties::default(),
        )
        .await?;

    let mut publisher = EventPublisher::connect(&config).await?;
    for _ in 0..2 {
        let event = Event::new(EventType::NotificationDue, &serde_json::json!({}))?;
        publisher.publish(&event, None).await?;
    }

    // Both decodable events reach the handler even though it fails every
    // time, and nothing is left unacked on the queue.
    wait_for_handled(&handled, 2, Duration::from_secs(10)).await?;
    wait_for_queue_count(&channel, "notifications", 0, Duration::from_secs(5)).await?;

    publisher.close().await?;
    consumer_task.abort();

    // A consumer that never started consuming shuts down cleanly too.
    let idle = EventConsumer::connect(&config, "notifications").await?;
    idle.close().await?;

    Ok(())
}

fn load_config() -> Option<Config> {
    match Config::load() {
        Ok(config) => Some(config),
        Err(_) => {
            eprintln!("RABBITMQ_URL / DATABASE_URL not configured; skipping integration test");
            None
        }
    }
}

async fn wait_for_handled(
    counter: &Arc<AtomicUsize>,
    expected: usize,
    timeout: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;

    while counter.load(Ordering::SeqCst) < expected {
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!(
                "handler saw {} events, expected {expected}",
                counter.load(Ordering::SeqCst)
            ));
        }
        sleep(Duration::from_millis(100)).await;
    }

    Ok(())
}

async fn wait_for_queue_count(
    channel: &Channel,
    queue: &str,
    expected: u32,
    timeout: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let declared = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        if declared.message_count() == expected {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!(
                "queue {queue} stuck at {}, expected {expected}",
                declared.message_count()
            ));
        }
        sleep(Duration::from_millis(200)).await;
    }
}
