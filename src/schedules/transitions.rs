use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    clients::database::Database,
    daemons::scheduler::{DueRecord, ScheduleSource},
    error::{EventError, Result},
    models::{
        event::{Event, EventType, StatusTransitionPayload},
        schedule::{GameStatus, StatusSchedule},
    },
};

/// Fired by the `status_schedules` triggers on insert/update/delete.
pub const STATUS_CHANNEL: &str = "status_schedule_changed";

const NEXT_DUE_SQL: &str = "\
SELECT ss.id, ss.game_id, ss.transition_at, ss.from_status, ss.to_status, g.group_id
FROM status_schedules ss
JOIN games g ON g.id = ss.game_id
WHERE NOT ss.processed
ORDER BY ss.transition_at ASC
LIMIT 1";

const MARK_PROCESSED_SQL: &str = "UPDATE status_schedules SET processed = TRUE WHERE id = $1";

/// Watches `status_schedules` and emits `game.status_transition` events.
pub struct StatusTransitionSource;

#[async_trait]
impl ScheduleSource for StatusTransitionSource {
    type Record = StatusSchedule;

    fn name(&self) -> &'static str {
        "status_transitions"
    }

    fn notify_channel(&self) -> &'static str {
        STATUS_CHANNEL
    }

    async fn next_due(&self, db: &Database) -> Result<Option<DueRecord<StatusSchedule>>> {
        let row = match db.client().query_opt(NEXT_DUE_SQL, &[]).await? {
            Some(row) => row,
            None => return Ok(None),
        };

        let record = StatusSchedule {
            id: row.try_get("id")?,
            game_id: row.try_get("game_id")?,
            group_id: row.try_get("group_id")?,
            transition_at: row.try_get("transition_at")?,
            from_status: parse_status(row.try_get("from_status")?)?,
            to_status: parse_status(row.try_get("to_status")?)?,
        };

        Ok(Some(DueRecord {
            id: record.id,
            due_at: record.transition_at,
            record,
        }))
    }

    async fn mark_processed(&self, db: &Database, id: Uuid) -> Result<()> {
        db.client().execute(MARK_PROCESSED_SQL, &[&id]).await?;

        Ok(())
    }

    /// Status transitions carry no TTL. Dropping one silently would leave
    /// the persisted game state permanently inconsistent, so the event must
    /// eventually be delivered no matter how many retry cycles it takes.
    fn build_event(&self, record: &StatusSchedule) -> Result<(Event, Option<Duration>)> {
        let payload = StatusTransitionPayload {
            game_id: record.game_id,
            from_status: record.from_status,
            to_status: record.to_status,
            transition_at: record.transition_at,
        };

        let event = Event::new(EventType::GameStatusTransition, &payload)?
            .with_deterministic_id(record.id, record.transition_at);

        Ok((event, None))
    }
}

fn parse_status(raw: String) -> Result<GameStatus> {
    GameStatus::parse(&raw)
        .ok_or_else(|| EventError::InvalidRecord(format!("unknown game status '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use crate::models::event::deterministic_event_id;

    #[test]
    fn built_event_carries_no_ttl() {
        let record = StatusSchedule {
            id: Uuid::new_v4(),
            game_id: Uuid::new_v4(),
            group_id: Some(Uuid::new_v4()),
            transition_at: Utc::now() - TimeDelta::seconds(3),
            from_status: GameStatus::Open,
            to_status: GameStatus::Running,
        };

        let (event, ttl) = StatusTransitionSource.build_event(&record).unwrap();

        assert!(ttl.is_none());
        assert_eq!(event.routing_key(), "game.status_transition");
        assert_eq!(
            event.event_id,
            deterministic_event_id(record.id, record.transition_at)
        );
        assert_eq!(event.data["from_status"], serde_json::json!("open"));
        assert_eq!(event.data["to_status"], serde_json::json!("running"));
    }

    #[test]
    fn unknown_status_text_is_rejected() {
        assert!(parse_status("archived".to_string()).is_err());
        assert!(parse_status("open".to_string()).is_ok());
    }
}
