use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use lapin::{
    Channel, Connection,
    message::BasicGetMessage,
    options::{BasicAckOptions, BasicGetOptions, BasicRejectOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
};
use tracing::{debug, info, warn};

use crate::{
    clients::rbmq::{EventPublisher, connect_broker},
    config::Config,
    error::Result,
    models::{
        event::Event,
        health::{DurationStats, RetryQueueReport, RetrySnapshot},
    },
};

/// One entry of the broker-maintained `x-death` header list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeathRecord {
    pub count: i64,
    pub reason: String,
    pub queue: String,
    pub exchange: String,
    pub routing_keys: Vec<String>,
}

/// Extracts the most recent death entry from a message's headers. The broker
/// prepends entries, so the first one describes the hop that landed the
/// message in the dead-letter queue and carries the routing key it was
/// originally published with.
pub fn first_death(headers: &Option<FieldTable>) -> Option<DeathRecord> {
    let headers = headers.as_ref()?;

    let deaths = match field(headers, "x-death") {
        Some(AMQPValue::FieldArray(deaths)) => deaths,
        _ => return None,
    };

    let entry = match deaths.as_slice().first() {
        Some(AMQPValue::FieldTable(entry)) => entry,
        _ => return None,
    };

    Some(DeathRecord {
        count: long_field(entry, "count").unwrap_or(0),
        reason: string_field(entry, "reason").unwrap_or_default(),
        queue: string_field(entry, "queue").unwrap_or_default(),
        exchange: string_field(entry, "exchange").unwrap_or_default(),
        routing_keys: string_array_field(entry, "routing-keys"),
    })
}

/// The routing key a dead-lettered message should be republished with:
/// the first recorded key of its first death, else the key it was delivered
/// with (covers messages placed into a DLQ directly, without metadata).
pub fn recovered_routing_key(death: Option<&DeathRecord>, delivery_key: &str) -> String {
    match death {
        Some(death) if !death.routing_keys.is_empty() => death.routing_keys[0].clone(),
        _ => delivery_key.to_string(),
    }
}

fn field<'a>(table: &'a FieldTable, key: &str) -> Option<&'a AMQPValue> {
    table
        .inner()
        .iter()
        .find(|(k, _)| k.as_str() == key)
        .map(|(_, v)| v)
}

fn string_field(table: &FieldTable, key: &str) -> Option<String> {
    match field(table, key) {
        Some(AMQPValue::LongString(s)) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        Some(AMQPValue::ShortString(s)) => Some(s.as_str().to_string()),
        _ => None,
    }
}

fn long_field(table: &FieldTable, key: &str) -> Option<i64> {
    match field(table, key) {
        Some(AMQPValue::LongLongInt(v)) => Some(*v),
        Some(AMQPValue::LongInt(v)) => Some(i64::from(*v)),
        Some(AMQPValue::LongUInt(v)) => Some(i64::from(*v)),
        Some(AMQPValue::ShortInt(v)) => Some(i64::from(*v)),
        _ => None,
    }
}

fn string_array_field(table: &FieldTable, key: &str) -> Vec<String> {
    match field(table, key) {
        Some(AMQPValue::FieldArray(values)) => values
            .as_slice()
            .iter()
            .filter_map(|value| match value {
                AMQPValue::LongString(s) => {
                    Some(String::from_utf8_lossy(s.as_bytes()).into_owned())
                }
                AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[derive(Debug, Default, Clone)]
struct QueueStats {
    depth: u32,
    processed_total: u64,
    failed_total: u64,
    consecutive_failures: u32,
    last_success_at: Option<DateTime<Utc>>,
}

struct StatsInner {
    queues: HashMap<String, QueueStats>,
    cycle_durations: DurationStats,
}

/// Shared retry-daemon observability. Updated by the daemon, read by the
/// health endpoint.
pub struct RetryStats {
    broker_reachable: AtomicBool,
    failure_threshold: u32,
    inner: Mutex<StatsInner>,
}

impl RetryStats {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            broker_reachable: AtomicBool::new(true),
            failure_threshold,
            inner: Mutex::new(StatsInner {
                queues: HashMap::new(),
                cycle_durations: DurationStats::default(),
            }),
        }
    }

    pub fn mark_broker(&self, reachable: bool) {
        self.broker_reachable.store(reachable, Ordering::Relaxed);
    }

    /// A cycle counts as failed only when it processed nothing and failed at
    /// least once; draining an empty queue or making partial progress both
    /// reset the consecutive-failure counter.
    pub fn record_queue_cycle(&self, queue: &str, processed: u64, failed: u64) {
        let mut inner = self.lock();
        let stats = inner.queues.entry(queue.to_string()).or_default();

        stats.processed_total += processed;
        stats.failed_total += failed;

        if processed == 0 && failed > 0 {
            stats.consecutive_failures += 1;
        } else {
            stats.consecutive_failures = 0;
            stats.last_success_at = Some(Utc::now());
        }
    }

    pub fn record_depth(&self, queue: &str, depth: u32) {
        let mut inner = self.lock();
        inner.queues.entry(queue.to_string()).or_default().depth = depth;
    }

    pub fn record_cycle_duration(&self, duration: Duration) {
        self.lock().cycle_durations.record(duration);
    }

    pub fn is_healthy(&self) -> bool {
        if !self.broker_reachable.load(Ordering::Relaxed) {
            return false;
        }

        self.lock()
            .queues
            .values()
            .all(|q| q.consecutive_failures <= self.failure_threshold)
    }

    pub fn snapshot(&self) -> RetrySnapshot {
        let broker_reachable = self.broker_reachable.load(Ordering::Relaxed);
        let inner = self.lock();

        let mut queues: Vec<RetryQueueReport> = inner
            .queues
            .iter()
            .map(|(name, stats)| RetryQueueReport {
                queue: name.clone(),
                depth: stats.depth,
                processed_total: stats.processed_total,
                failed_total: stats.failed_total,
                consecutive_failures: stats.consecutive_failures,
                last_success_at: stats.last_success_at,
            })
            .collect();
        queues.sort_by(|a, b| a.queue.cmp(&b.queue));

        let healthy = broker_reachable
            && inner
                .queues
                .values()
                .all(|q| q.consecutive_failures <= self.failure_threshold);

        RetrySnapshot {
            healthy,
            broker_reachable,
            queues,
            cycle_duration: inner.cycle_durations.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatsInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Drains every dead-letter queue on a fixed interval and republishes each
/// message to the main exchange under its original routing key, with no
/// expiration, so it cannot re-expire back into the dead-letter queue.
pub struct RetryDaemon {
    url: String,
    queues: Vec<String>,
    interval: Duration,
    error_backoff: Duration,
    connection: Option<Connection>,
    channel: Option<Channel>,
    publisher: EventPublisher,
    stats: Arc<RetryStats>,
    shutdown: Arc<AtomicBool>,
}

impl RetryDaemon {
    pub async fn new(
        config: &Config,
        stats: Arc<RetryStats>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let publisher = EventPublisher::connect(config).await?;

        Ok(Self {
            url: config.rabbitmq_url.clone(),
            queues: config.topology().dead_letter_queues(),
            interval: Duration::from_secs(config.retry_interval_seconds),
            error_backoff: Duration::from_secs(config.scheduler_error_backoff_seconds),
            connection: None,
            channel: None,
            publisher,
            stats,
            shutdown,
        })
    }

    pub async fn run(mut self) {
        info!(
            interval_seconds = self.interval.as_secs(),
            queues = ?self.queues,
            "Retry daemon started"
        );

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            let started = Instant::now();

            match self.run_cycle().await {
                Ok(()) => {
                    self.stats.record_cycle_duration(started.elapsed());
                    tokio::time::sleep(self.interval).await;
                }
                Err(e) => {
                    self.stats.mark_broker(false);
                    warn!(error = %e, "Retry cycle failed");
                    tokio::time::sleep(self.error_backoff).await;
                }
            }
        }

        self.teardown().await;
        info!("Retry daemon stopped");
    }

    /// One full pass over every configured dead-letter queue.
    pub async fn run_cycle(&mut self) -> Result<()> {
        let channel = self.ensure_channel().await?;
        self.stats.mark_broker(true);

        for queue in self.queues.clone() {
            self.process_queue(&channel, &queue).await?;
        }

        Ok(())
    }

    async fn ensure_channel(&mut self) -> Result<Channel> {
        if let Some(channel) = &self.channel {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let connection = connect_broker(&self.url).await?;
        let channel = connection.create_channel().await?;

        self.connection = Some(connection);
        self.channel = Some(channel.clone());

        Ok(channel)
    }

    /// Drains up to the depth observed at the start of the cycle. Messages
    /// dead-lettered mid-drain wait for the next cycle, keeping each cycle
    /// bounded.
    async fn process_queue(&mut self, channel: &Channel, queue: &str) -> Result<()> {
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

        let depth = declared.message_count();
        self.stats.record_depth(queue, depth);

        if depth == 0 {
            self.stats.record_queue_cycle(queue, 0, 0);
            return Ok(());
        }

        info!(queue = %queue, depth, "Draining dead-letter queue");

        let mut processed = 0u64;
        let mut failed = 0u64;

        for _ in 0..depth {
            match channel.basic_get(queue, BasicGetOptions::default()).await? {
                Some(message) => {
                    if self.retry_message(channel, queue, message).await {
                        processed += 1;
                    } else {
                        failed += 1;
                    }
                }
                None => break,
            }
        }

        self.stats.record_queue_cycle(queue, processed, failed);
        self.stats.record_depth(queue, failed as u32);

        info!(queue = %queue, processed, failed, "Dead-letter queue drained");

        Ok(())
    }

    /// Returns true when the message was republished and acknowledged.
    /// Anything else leaves the message in the dead-letter queue for the
    /// next cycle; nothing is dropped silently.
    async fn retry_message(
        &mut self,
        channel: &Channel,
        queue: &str,
        message: BasicGetMessage,
    ) -> bool {
        let delivery = message.delivery;
        let tag = delivery.delivery_tag;

        if let Err(e) = serde_json::from_slice::<Event>(&delivery.data) {
            warn!(
                queue = %queue,
                error = %e,
                "Dead-lettered message is not a valid event, leaving for inspection"
            );
            return self.requeue(channel, queue, tag).await;
        }

        let death = first_death(delivery.properties.headers());
        let routing_key = recovered_routing_key(death.as_ref(), delivery.routing_key.as_str());

        if let Some(death) = &death {
            debug!(
                queue = %queue,
                routing_key = %routing_key,
                death_count = death.count,
                reason = %death.reason,
                "Republishing dead-lettered message"
            );
        }

        match self.publisher.republish(&delivery.data, &routing_key).await {
            Ok(()) => match channel.basic_ack(tag, BasicAckOptions::default()).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Failed to acknowledge retried message");
                    false
                }
            },
            Err(e) => {
                warn!(queue = %queue, error = %e, "Republish failed, leaving message in queue");
                self.requeue(channel, queue, tag).await
            }
        }
    }

    async fn requeue(&self, channel: &Channel, queue: &str, tag: u64) -> bool {
        if let Err(e) = channel
            .basic_reject(tag, BasicRejectOptions { requeue: true })
            .await
        {
            warn!(queue = %queue, error = %e, "Failed to requeue message");
        }

        false
    }

    async fn teardown(mut self) {
        if let Err(e) = self.publisher.close().await {
            warn!(error = %e, "Failed to close retry publisher");
        }

        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close(200, "retry daemon shutdown").await {
                warn!(error = %e, "Failed to close retry channel");
            }
        }

        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close(200, "retry daemon shutdown").await {
                warn!(error = %e, "Failed to close retry connection");
            }
        }
    }
}
