use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ContinuationError>;

#[derive(Error, Debug)]
pub enum ContinuationError {
    /// The input does not have the shape the handler expects. Never retried.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The continuation token could not be decoded. Never retried.
    #[error("Invalid continuation token: {0}")]
    TokenDecode(#[source] serde_json::Error),

    #[error("Failed to encode continuation token: {0}")]
    TokenEncode(#[source] serde_json::Error),

    /// The provider reported a terminal failure.
    #[error("Operation failed: {detail}")]
    OperationFailed { detail: String },

    #[error("Not supported: {0}")]
    NotSupported(String),

    /// A dependency is briefly unavailable; the same step should be redelivered.
    #[error("Temporarily unavailable: {reason}")]
    TemporarilyUnavailable { reason: String, retry_after: Duration },

    #[error("No handler registered for target '{0}'")]
    NoHandler(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error(transparent)]
    External(#[from] anyhow::Error),
}
