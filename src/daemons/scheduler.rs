use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    clients::{database::Database, listener::NotificationListener, rbmq::EventPublisher},
    config::Config,
    error::Result,
    models::event::Event,
};

#[derive(Debug, Clone)]
pub struct DueRecord<R> {
    pub id: Uuid,
    pub due_at: DateTime<Utc>,
    pub record: R,
}

/// What a scheduler daemon watches and how it turns due records into
/// events. The daemon itself is written once; each schedule table provides
/// an implementation.
#[async_trait]
pub trait ScheduleSource: Send + Sync {
    type Record: Send + Sync;

    fn name(&self) -> &'static str;

    /// Postgres channel whose NOTIFY wakes the daemon early.
    fn notify_channel(&self) -> &'static str;

    /// The single earliest unprocessed record, if any. At most one row so
    /// the query stays an index lookup regardless of table size.
    async fn next_due(&self, db: &Database) -> Result<Option<DueRecord<Self::Record>>>;

    async fn mark_processed(&self, db: &Database, id: Uuid) -> Result<()>;

    /// The outbound event for a due record, with an optional per-message
    /// expiration.
    fn build_event(&self, record: &Self::Record) -> Result<(Event, Option<Duration>)>;
}

/// How long the daemon may wait before acting. `None` means a record is due
/// now and must be processed without waiting. With no record at all the wait
/// is the full `max_timeout`, so rows inserted without a notification are
/// still picked up within one timeout period.
pub fn wait_budget(
    next_due: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    max_timeout: Duration,
) -> Option<Duration> {
    match next_due {
        None => Some(max_timeout),
        Some(due_at) => {
            let until_due = (due_at - now).to_std().unwrap_or(Duration::ZERO);
            if until_due.is_zero() {
                None
            } else {
                Some(until_due.min(max_timeout))
            }
        }
    }
}

pub struct SchedulerDaemon<S: ScheduleSource> {
    source: S,
    db: Database,
    listener: NotificationListener,
    publisher: EventPublisher,
    max_timeout: Duration,
    error_backoff: Duration,
    shutdown: Arc<AtomicBool>,
}

impl<S: ScheduleSource> SchedulerDaemon<S> {
    pub async fn new(config: &Config, source: S, shutdown: Arc<AtomicBool>) -> Result<Self> {
        let db = Database::connect(&config.database_url).await?;

        let mut listener = NotificationListener::connect(&config.database_url).await?;
        listener.listen(source.notify_channel()).await?;

        let publisher = EventPublisher::connect(config).await?;

        Ok(Self {
            source,
            db,
            listener,
            publisher,
            max_timeout: Duration::from_secs(config.scheduler_max_timeout_seconds),
            error_backoff: Duration::from_secs(config.scheduler_error_backoff_seconds),
            shutdown,
        })
    }

    pub async fn run(mut self) {
        info!(
            source = self.source.name(),
            channel = self.source.notify_channel(),
            max_timeout_seconds = self.max_timeout.as_secs(),
            "Scheduler daemon started"
        );

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            if let Err(e) = self.iteration().await {
                warn!(
                    source = self.source.name(),
                    error = %e,
                    "Scheduler iteration failed"
                );
                tokio::time::sleep(self.error_backoff).await;
            }
        }

        let name = self.source.name();
        self.teardown().await;
        info!(source = name, "Scheduler daemon stopped");
    }

    async fn iteration(&mut self) -> Result<()> {
        let next = self.next_due_with_reset().await?;
        let next_due_at = next.as_ref().map(|record| record.due_at);

        match wait_budget(next_due_at, Utc::now(), self.max_timeout) {
            None => {
                if let Some(record) = next {
                    self.process(record).await?;
                }
            }
            Some(wait) => {
                debug!(
                    source = self.source.name(),
                    wait_seconds = wait.as_secs(),
                    "Waiting for due record or schedule change"
                );

                if self.listener.wait_for_notification(wait).await?.is_some() {
                    debug!(source = self.source.name(), "Woken by schedule change");
                }
                // Whatever caused the wake, the next iteration re-queries.
                // The woken-for record may already be processed, or a new
                // record may now be due sooner.
            }
        }

        Ok(())
    }

    async fn next_due_with_reset(&mut self) -> Result<Option<DueRecord<S::Record>>> {
        if self.db.is_closed() {
            self.db.reset().await?;
        }

        match self.source.next_due(&self.db).await {
            Ok(next) => Ok(next),
            Err(e) => {
                warn!(
                    source = self.source.name(),
                    error = %e,
                    "Schedule query failed, resetting session"
                );
                self.db.reset().await?;
                self.source.next_due(&self.db).await
            }
        }
    }

    async fn process(&mut self, due: DueRecord<S::Record>) -> Result<()> {
        let (event, ttl) = self.source.build_event(&due.record)?;
        let event_id = event.event_id;

        // Publish before marking processed. A crash in between re-emits the
        // same event (same event_id) on restart; consumers deduplicate.
        self.publisher.publish_with_ttl(&event, ttl, None).await?;
        self.source.mark_processed(&self.db, due.id).await?;

        info!(
            source = self.source.name(),
            record_id = %due.id,
            event_id = %event_id,
            "Due record processed"
        );

        Ok(())
    }

    async fn teardown(self) {
        if let Err(e) = self.publisher.close().await {
            warn!(error = %e, "Failed to close scheduler publisher");
        }

        self.listener.close();
        self.db.close();
    }
}
