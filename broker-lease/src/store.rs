use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

/// Address of a lease blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobKey {
    pub container: String,
    pub name: String,
}

impl BlobKey {
    pub fn new(container: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.name)
    }
}

/// Object-store primitive that backs distributed leases.
///
/// Implementations must enforce at most one live lease per blob. A lease that
/// is not renewed within its duration expires and may be acquired by anyone.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn create_container_if_absent(&self, container: &str) -> Result<()>;

    /// Creates the blob with `body` unless it already exists.
    async fn create_blob_if_absent(&self, key: &BlobKey, body: &str) -> Result<()>;

    /// Acquires a lease, returning its id.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::AlreadyPresent`](crate::LeaseError::AlreadyPresent)
    /// while another holder's lease is live, and `BlobNotFound` if the blob
    /// was never created.
    async fn acquire(&self, key: &BlobKey, duration: Duration) -> Result<String>;

    async fn renew(&self, key: &BlobKey, lease_id: &str) -> Result<()>;

    async fn release(&self, key: &BlobKey, lease_id: &str) -> Result<()>;

    /// Last write time of the blob, or `None` when it does not exist.
    async fn last_modified(&self, key: &BlobKey) -> Result<Option<DateTime<Utc>>>;

    /// Rewrites the blob body under the given lease, bumping its last write time.
    async fn touch(&self, key: &BlobKey, lease_id: &str, body: &str) -> Result<()>;
}
