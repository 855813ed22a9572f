use crate::resource::ResourceType;
use broker_continuation::ContinuationError;
use broker_lease::LeaseError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Out of capacity: no pooled {resource_type} '{sku}' available in {location}")]
    OutOfCapacity {
        sku: String,
        resource_type: ResourceType,
        location: String,
    },

    #[error("Not supported: {0}")]
    NotSupported(String),

    /// The record changed between read and write.
    #[error("Concurrent modification of {0}")]
    Conflict(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Continuation error: {0}")]
    Continuation(#[from] ContinuationError),

    #[error("Lease error: {0}")]
    Lease(#[from] LeaseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Pool definition error: {0}")]
    PoolDefinition(#[from] serde_yaml_ng::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<BrokerError> for ContinuationError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Continuation(inner) => inner,
            BrokerError::InvalidInput(msg) => ContinuationError::InvalidInput(msg),
            BrokerError::NotSupported(msg) => ContinuationError::NotSupported(msg),
            other => ContinuationError::External(other.into()),
        }
    }
}
