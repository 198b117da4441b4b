use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    clients::database::Database,
    daemons::scheduler::{DueRecord, ScheduleSource},
    error::Result,
    models::{
        event::{Event, EventType, ReminderPayload},
        schedule::ReminderSchedule,
    },
};

/// Fired by the `notification_schedules` triggers on insert/update/delete.
pub const REMINDER_CHANNEL: &str = "notification_schedule_changed";

const MIN_REMINDER_TTL: Duration = Duration::from_secs(60);

const NEXT_DUE_SQL: &str = "\
SELECT ns.id, ns.game_id, ns.remind_at, g.title, g.starts_at, g.group_id
FROM notification_schedules ns
JOIN games g ON g.id = ns.game_id
WHERE NOT ns.processed
ORDER BY ns.remind_at ASC
LIMIT 1";

const MARK_PROCESSED_SQL: &str =
    "UPDATE notification_schedules SET processed = TRUE WHERE id = $1";

/// Watches `notification_schedules` and emits `notification_due` events.
pub struct ReminderSource;

#[async_trait]
impl ScheduleSource for ReminderSource {
    type Record = ReminderSchedule;

    fn name(&self) -> &'static str {
        "reminders"
    }

    fn notify_channel(&self) -> &'static str {
        REMINDER_CHANNEL
    }

    async fn next_due(&self, db: &Database) -> Result<Option<DueRecord<ReminderSchedule>>> {
        let row = match db.client().query_opt(NEXT_DUE_SQL, &[]).await? {
            Some(row) => row,
            None => return Ok(None),
        };

        let record = ReminderSchedule {
            id: row.try_get("id")?,
            game_id: row.try_get("game_id")?,
            game_title: row.try_get("title")?,
            group_id: row.try_get("group_id")?,
            remind_at: row.try_get("remind_at")?,
            starts_at: row.try_get("starts_at")?,
        };

        Ok(Some(DueRecord {
            id: record.id,
            due_at: record.remind_at,
            record,
        }))
    }

    async fn mark_processed(&self, db: &Database, id: Uuid) -> Result<()> {
        db.client().execute(MARK_PROCESSED_SQL, &[&id]).await?;

        Ok(())
    }

    fn build_event(&self, record: &ReminderSchedule) -> Result<(Event, Option<Duration>)> {
        let payload = ReminderPayload {
            game_id: record.game_id,
            game_title: record.game_title.clone(),
            starts_at: record.starts_at,
            remind_at: record.remind_at,
        };

        let event = Event::new(EventType::NotificationDue, &payload)?
            .with_deterministic_id(record.id, record.remind_at);

        Ok((event, Some(reminder_ttl(record.starts_at, Utc::now()))))
    }
}

/// TTL for a reminder: the time left until the game starts, floored at 60
/// seconds. A reminder that outlives the start of its game is useless, so it
/// expires instead of being delivered late.
pub fn reminder_ttl(starts_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (starts_at - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
        .max(MIN_REMINDER_TTL)
}
