use thiserror::Error;

/// Error taxonomy for the scheduling and delivery subsystem.
///
/// Broker and database failures are transient by nature and handled with a
/// single transparent reconnect at the client layer; what surfaces here is
/// what remains after that reconnect also failed.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("message broker unavailable: {0}")]
    BrokerUnavailable(#[from] lapin::Error),

    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid schedule record: {0}")]
    InvalidRecord(String),
}

pub type Result<T> = std::result::Result<T, EventError>;
