use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle states a game moves through. Transitions are driven by rows in
/// `status_schedules`, never by this subsystem's own clock logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Scheduled,
    Open,
    Running,
    Finished,
    Cancelled,
}

impl GameStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameStatus::Scheduled => "scheduled",
            GameStatus::Open => "open",
            GameStatus::Running => "running",
            GameStatus::Finished => "finished",
            GameStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(GameStatus::Scheduled),
            "open" => Some(GameStatus::Open),
            "running" => Some(GameStatus::Running),
            "finished" => Some(GameStatus::Finished),
            "cancelled" => Some(GameStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for GameStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An unprocessed reminder row joined with the game fields the event payload
/// needs. Only rows with `processed = false` are ever materialized here.
#[derive(Debug, Clone)]
pub struct ReminderSchedule {
    pub id: Uuid,
    pub game_id: Uuid,
    pub game_title: String,
    pub group_id: Option<Uuid>,
    pub remind_at: DateTime<Utc>,
    pub starts_at: DateTime<Utc>,
}

/// An unprocessed status-transition row.
#[derive(Debug, Clone)]
pub struct StatusSchedule {
    pub id: Uuid,
    pub game_id: Uuid,
    pub group_id: Option<Uuid>,
    pub transition_at: DateTime<Utc>,
    pub from_status: GameStatus,
    pub to_status: GameStatus,
}
