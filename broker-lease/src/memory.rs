//! In-process [`LeaseStore`] used by tests and single-node deployments.

use crate::error::{LeaseError, Result};
use crate::store::{BlobKey, LeaseStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

struct HeldLease {
    id: String,
    duration: Duration,
    expires_at: Instant,
}

struct Blob {
    body: String,
    last_modified: DateTime<Utc>,
    lease: Option<HeldLease>,
}

impl Blob {
    fn live_lease(&self, now: Instant) -> Option<&HeldLease> {
        self.lease.as_ref().filter(|l| l.expires_at > now)
    }
}

#[derive(Default)]
struct Inner {
    containers: HashSet<String>,
    blobs: HashMap<BlobKey, Blob>,
}

/// Lease store backed by a mutex-guarded map. Lease expiry follows the tokio
/// clock so paused-time tests can drive it.
#[derive(Default)]
pub struct MemoryLeaseStore {
    inner: Mutex<Inner>,
    blob_creates: AtomicUsize,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs actually created (not counting no-op calls).
    pub fn blob_creates(&self) -> usize {
        self.blob_creates.load(Ordering::SeqCst)
    }

    /// Current body of a blob, if present.
    pub fn body(&self, key: &BlobKey) -> Option<String> {
        self.lock().blobs.get(key).map(|b| b.body.clone())
    }

    /// Whether the blob currently carries an unexpired lease.
    pub fn is_leased(&self, key: &BlobKey) -> bool {
        let now = Instant::now();
        self.lock()
            .blobs
            .get(key)
            .is_some_and(|b| b.live_lease(now).is_some())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned map is still structurally valid.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn create_container_if_absent(&self, container: &str) -> Result<()> {
        self.lock().containers.insert(container.to_string());
        Ok(())
    }

    async fn create_blob_if_absent(&self, key: &BlobKey, body: &str) -> Result<()> {
        let mut inner = self.lock();
        if !inner.containers.contains(&key.container) {
            return Err(LeaseError::BlobNotFound(format!(
                "container {} does not exist",
                key.container
            )));
        }
        if !inner.blobs.contains_key(key) {
            inner.blobs.insert(
                key.clone(),
                Blob {
                    body: body.to_string(),
                    last_modified: Utc::now(),
                    lease: None,
                },
            );
            self.blob_creates.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn acquire(&self, key: &BlobKey, duration: Duration) -> Result<String> {
        let now = Instant::now();
        let mut inner = self.lock();
        let blob = inner
            .blobs
            .get_mut(key)
            .ok_or_else(|| LeaseError::BlobNotFound(key.to_string()))?;

        if blob.live_lease(now).is_some() {
            return Err(LeaseError::AlreadyPresent(key.to_string()));
        }

        let id = Uuid::new_v4().to_string();
        blob.lease = Some(HeldLease {
            id: id.clone(),
            duration,
            expires_at: now + duration,
        });
        Ok(id)
    }

    async fn renew(&self, key: &BlobKey, lease_id: &str) -> Result<()> {
        let now = Instant::now();
        let mut inner = self.lock();
        let blob = inner
            .blobs
            .get_mut(key)
            .ok_or_else(|| LeaseError::BlobNotFound(key.to_string()))?;

        match blob.lease.as_mut() {
            Some(lease) if lease.id == lease_id && lease.expires_at > now => {
                lease.expires_at = now + lease.duration;
                Ok(())
            }
            _ => Err(LeaseError::LeaseLost(key.to_string())),
        }
    }

    async fn release(&self, key: &BlobKey, lease_id: &str) -> Result<()> {
        let mut inner = self.lock();
        let blob = inner
            .blobs
            .get_mut(key)
            .ok_or_else(|| LeaseError::BlobNotFound(key.to_string()))?;

        match &blob.lease {
            Some(lease) if lease.id == lease_id => {
                blob.lease = None;
                Ok(())
            }
            _ => Err(LeaseError::LeaseLost(key.to_string())),
        }
    }

    async fn last_modified(&self, key: &BlobKey) -> Result<Option<DateTime<Utc>>> {
        Ok(self.lock().blobs.get(key).map(|b| b.last_modified))
    }

    async fn touch(&self, key: &BlobKey, lease_id: &str, body: &str) -> Result<()> {
        let now = Instant::now();
        let mut inner = self.lock();
        let blob = inner
            .blobs
            .get_mut(key)
            .ok_or_else(|| LeaseError::BlobNotFound(key.to_string()))?;

        if blob.live_lease(now).is_some_and(|l| l.id == lease_id) {
            blob.body = body.to_string();
            blob.last_modified = Utc::now();
            Ok(())
        } else {
            Err(LeaseError::LeaseLost(key.to_string()))
        }
    }
}
