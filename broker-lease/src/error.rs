use thiserror::Error;

pub type Result<T> = std::result::Result<T, LeaseError>;

#[derive(Error, Debug)]
pub enum LeaseError {
    /// Another holder owns a live lease on the blob.
    #[error("Lease already present on {0}")]
    AlreadyPresent(String),

    #[error("Lease blob not found: {0}")]
    BlobNotFound(String),

    /// The lease id no longer matches the blob's current lease.
    #[error("Lease lost on {0}")]
    LeaseLost(String),

    #[error("Invalid lease name: {0}")]
    InvalidName(String),

    #[error("Lease store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl LeaseError {
    /// Wraps a backend failure.
    pub fn store<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Store(Box::new(err))
    }
}
