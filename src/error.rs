//! Error types shared across the relay components.

use thiserror::Error;

/// Failures while parsing a client frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("invalid frame format: {0}")]
    InvalidFormat(String),

    #[error("unknown frame type: {0}")]
    UnknownType(String),

    #[error("missing field: {0}")]
    MissingField(String),
}

/// Failures while validating an event.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("event id does not match the canonical hash")]
    IdMismatch,

    #[error("invalid event signature")]
    Signature,

    #[error("event creation date is too far off from the current time")]
    FromFuture,
}

/// Failures reported by a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An event with the same id is already stored.
    #[error("duplicate: already have this event")]
    Duplicate,

    #[error("storage backend error: {0}")]
    Backend(String),

    /// The backend did not answer within the deadline.
    #[error("timed out waiting for response from storage backend")]
    Timeout,
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.is_unique_violation() {
                return StoreError::Duplicate;
            }
        }
        StoreError::Backend(err.to_string())
    }
}

/// Failures while ingesting a single event frame.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to query storage for existing replaceable events: {0}")]
    ReplaceQuery(StoreError),

    #[error("failed to delete stale replaceable event: {0}")]
    ReplaceDelete(StoreError),

    #[error("timed out while querying storage for existing replaceable events")]
    ReplaceQueryTimeout,
}
