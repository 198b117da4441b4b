use std::{collections::HashMap, sync::Arc, time::Instant};

use chrono::Utc;
use lapin::{Channel, options::QueueDeclareOptions, types::FieldTable};
use tracing::{debug, warn};

use crate::{
    clients::{database::Database, rbmq::connect_broker},
    config::Config,
    daemons::retry::RetryStats,
    models::health::{HealthCheckResponse, HealthStatus, RetrySnapshot, ServiceHealth},
};

pub struct HealthChecker {
    config: Config,
    retry_stats: Arc<RetryStats>,
}

impl HealthChecker {
    pub fn new(config: Config, retry_stats: Arc<RetryStats>) -> Self {
        Self {
            config,
            retry_stats,
        }
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let mut checks = HashMap::new();

        let db_health = self.check_database().await;
        checks.insert("database".to_string(), db_health);

        let broker_health = self.check_broker().await;
        checks.insert("message_broker".to_string(), broker_health);

        let retry = self.retry_stats.snapshot();
        let overall_status = self.determine_overall_status(&checks, &retry);

        HealthCheckResponse {
            status: overall_status,
            timestamp: Utc::now(),
            checks,
            retry: Some(retry),
        }
    }

    async fn check_database(&self) -> ServiceHealth {
        let start = Instant::now();

        match Database::connect(&self.config.database_url).await {
            Ok(client) => match client.health_check().await {
                Ok(_) => {
                    let elapsed = start.elapsed().as_millis() as u64;
                    debug!(response_time_ms = elapsed, "Database health check passed");
                    ServiceHealth::healthy(elapsed)
                }
                Err(e) => {
                    warn!(error = %e, "Database health check failed");
                    ServiceHealth::unhealthy(format!("Health check query failed: {}", e))
                }
            },
            Err(e) => {
                warn!(error = %e, "Database connection failed");
                ServiceHealth::unhealthy(format!("Connection failed: {}", e))
            }
        }
    }

    async fn check_broker(&self) -> ServiceHealth {
        let start = Instant::now();

        match connect_broker(&self.config.rabbitmq_url).await {
            Ok(connection) => match connection.create_channel().await {
                Ok(channel) => {
                    self.refresh_queue_depths(&channel).await;

                    let elapsed = start.elapsed().as_millis() as u64;
                    debug!(response_time_ms = elapsed, "RabbitMQ health check passed");
                    ServiceHealth::healthy(elapsed)
                }
                // Connection established but channel refused: the broker is
                // up yet not usable, which degrades rather than fails us.
                Err(e) => {
                    warn!(error = %e, "RabbitMQ channel creation failed");
                    ServiceHealth::degraded(format!("Channel creation failed: {}", e))
                }
            },
            Err(e) => {
                warn!(error = %e, "RabbitMQ connection failed");
                ServiceHealth::unhealthy(format!("Connection failed: {}", e))
            }
        }
    }

    /// Samples dead-letter queue depths so the health response reflects the
    /// current backlog, not the one from the last retry cycle. A passive
    /// declare failure closes the channel, so remaining probes just log.
    async fn refresh_queue_depths(&self, channel: &Channel) {
        for queue in self.config.topology().dead_letter_queues() {
            match channel
                .queue_declare(
                    &queue,
                    QueueDeclareOptions {
                        passive: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
            {
                Ok(declared) => {
                    self.retry_stats.record_depth(&queue, declared.message_count());
                }
                Err(e) => {
                    debug!(queue = %queue, error = %e, "Queue depth probe failed");
                }
            }
        }
    }

    fn determine_overall_status(
        &self,
        checks: &HashMap<String, ServiceHealth>,
        retry: &RetrySnapshot,
    ) -> HealthStatus {
        let has_unhealthy = checks
            .values()
            .any(|health| health.status == HealthStatus::Unhealthy);

        let has_degraded = checks
            .values()
            .any(|health| health.status == HealthStatus::Degraded);

        if has_unhealthy {
            HealthStatus::Unhealthy
        } else if has_degraded || !retry.healthy {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}
