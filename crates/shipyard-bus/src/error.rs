//! Bus error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    /// The topic has not been created yet. Retried while attaching.
    #[error("topic not found: {0}")]
    TopicNotFound(String),

    #[error("broker unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("gave up attaching to {topics} after {attempts} attempts")]
    AttachExhausted { topics: String, attempts: u32 },

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("bus closed")]
    Closed,
}

pub type BusResult<T> = std::result::Result<T, BusError>;

/// Failure reported by a message handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The payload could not be decoded. Logged and dropped.
    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// The message was understood but could not be processed. Logged and
    /// acknowledged; it will not be redelivered.
    #[error("{0}")]
    Rejected(String),

    /// Shared infrastructure failed. The consumer stops without
    /// acknowledging so the message is redelivered after a restart.
    #[error("infrastructure failure: {0}")]
    Infrastructure(String),
}
