use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::schedule::GameStatus;

/// Namespace for deterministic event ids (UUIDv5). Scheduler-built events
/// derive their id from the schedule record and its due time so that the
/// duplicate emitted after a publish-then-crash carries the same id and
/// consumers can deduplicate.
const EVENT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x7b6d_c2ae_51f4_4f0e_9a38_d1d0_06f1_9c44);

/// Every event kind carried over the broker. The serialized form doubles as
/// the default routing key, so the `game.*` family keeps its dot hierarchy
/// for topic-pattern bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "notification_due")]
    NotificationDue,
    #[serde(rename = "game.created")]
    GameCreated,
    #[serde(rename = "game.updated")]
    GameUpdated,
    #[serde(rename = "game.deleted")]
    GameDeleted,
    #[serde(rename = "game.status_transition")]
    GameStatusTransition,
}

impl EventType {
    pub fn routing_key(&self) -> &'static str {
        match self {
            EventType::NotificationDue => "notification_due",
            EventType::GameCreated => "game.created",
            EventType::GameUpdated => "game.updated",
            EventType::GameDeleted => "game.deleted",
            EventType::GameStatusTransition => "game.status_transition",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.routing_key())
    }
}

/// Wire envelope for every published event. `data` stays an untyped map so
/// consumers that do not know a new event kind can still pass it through.
/// Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub data: Map<String, Value>,

    #[serde(default)]
    pub trace_id: Option<String>,
}

impl Event {
    /// Build an envelope from a typed payload. Payloads serialize into the
    /// untyped `data` map; a non-object payload is wrapped under `"value"`.
    pub fn new<P: Serialize>(event_type: EventType, payload: &P) -> Result<Self, serde_json::Error> {
        let data = match serde_json::to_value(payload)? {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };

        Ok(Self {
            event_id: Uuid::new_v4(),
            event_type,
            timestamp: Utc::now(),
            data,
            trace_id: None,
        })
    }

    pub fn with_trace_id(mut self, trace_id: String) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    /// Replace the random id with one derived from the schedule record, so
    /// reprocessing the same record produces an identical id.
    pub fn with_deterministic_id(mut self, record_id: Uuid, due_at: DateTime<Utc>) -> Self {
        self.event_id = deterministic_event_id(record_id, due_at);
        self
    }

    pub fn routing_key(&self) -> &'static str {
        self.event_type.routing_key()
    }

    /// Per-tenant fanout key, e.g. `game.updated.<group_id>`, matched by
    /// `game.updated.#` bindings.
    pub fn fanout_routing_key(&self, group_id: Uuid) -> String {
        format!("{}.{}", self.routing_key(), group_id)
    }
}

pub fn deterministic_event_id(record_id: Uuid, due_at: DateTime<Utc>) -> Uuid {
    let name = format!("{}:{}", record_id, due_at.timestamp_micros());
    Uuid::new_v5(&EVENT_ID_NAMESPACE, name.as_bytes())
}

/// Payload of a `notification_due` event: everything the bot/SSE layers
/// need to render a reminder without a database round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderPayload {
    pub game_id: Uuid,
    pub game_title: String,
    pub starts_at: DateTime<Utc>,
    pub remind_at: DateTime<Utc>,
}

/// Payload of a `game.status_transition` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransitionPayload {
    pub game_id: Uuid,
    pub from_status: GameStatus,
    pub to_status: GameStatus,
    pub transition_at: DateTime<Utc>,
}

/// Payload shared by the `game.created` / `game.updated` / `game.deleted`
/// events published through the collaborator surface by the API layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GamePayload {
    pub game_id: Uuid,
    pub title: String,
    pub status: GameStatus,
    pub starts_at: DateTime<Utc>,

    #[serde(default)]
    pub group_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_reminder() -> ReminderPayload {
        ReminderPayload {
            game_id: Uuid::new_v4(),
            game_title: "Friday Catan".to_string(),
            starts_at: Utc.with_ymd_and_hms(2026, 3, 6, 19, 0, 0).unwrap(),
            remind_at: Utc.with_ymd_and_hms(2026, 3, 6, 18, 0, 0).unwrap(),
        }
    }

    #[test]
    fn event_type_routing_keys_keep_topic_hierarchy() {
        assert_eq!(EventType::NotificationDue.routing_key(), "notification_due");
        assert_eq!(
            EventType::GameStatusTransition.routing_key(),
            "game.status_transition"
        );
        assert_eq!(EventType::GameUpdated.routing_key(), "game.updated");
    }

    #[test]
    fn envelope_serializes_with_expected_fields() {
        let payload = sample_reminder();
        let event = Event::new(EventType::NotificationDue, &payload)
            .unwrap()
            .with_trace_id("trace-42".to_string());

        let json: Value = serde_json::to_value(&event).unwrap();

        assert_eq!(json["event_type"], "notification_due");
        assert_eq!(json["trace_id"], "trace-42");
        assert_eq!(json["data"]["game_title"], "Friday Catan");
        // RFC 3339 timestamp
        let ts = json["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
        assert!(Uuid::parse_str(json["event_id"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let event = Event::new(EventType::GameCreated, &sample_reminder()).unwrap();
        let bytes = serde_json::to_vec(&event).unwrap();
        let decoded: Event = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(decoded.event_type, EventType::GameCreated);
        assert_eq!(decoded.event_id, event.event_id);
        assert_eq!(decoded.data, event.data);
    }

    #[test]
    fn deterministic_id_is_stable_per_record_and_due_time() {
        let record_id = Uuid::new_v4();
        let due = Utc.with_ymd_and_hms(2026, 3, 6, 18, 0, 0).unwrap();

        let a = deterministic_event_id(record_id, due);
        let b = deterministic_event_id(record_id, due);
        assert_eq!(a, b);

        let other_due = due + chrono::Duration::seconds(1);
        assert_ne!(a, deterministic_event_id(record_id, other_due));
        assert_ne!(a, deterministic_event_id(Uuid::new_v4(), due));
    }

    #[test]
    fn fanout_routing_key_appends_group() {
        let group = Uuid::new_v4();
        let event = Event::new(EventType::GameUpdated, &sample_reminder()).unwrap();
        assert_eq!(
            event.fanout_routing_key(group),
            format!("game.updated.{}", group)
        );
    }

    #[test]
    fn non_object_payload_is_wrapped() {
        let event = Event::new(EventType::GameDeleted, &"gone").unwrap();
        assert_eq!(event.data["value"], "gone");
    }
}
