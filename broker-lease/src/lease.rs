use crate::error::{LeaseError, Result};
use crate::store::{BlobKey, LeaseStore};
use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

/// Body written into freshly created lease blobs.
pub const LEASE_BLOB_BODY: &str = "Lock file contents. Auto-generated. Do not modify.";

pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);
const RENEW_MARGIN: Duration = Duration::from_millis(7_500);

/// Tuning for [`DistributedLease`].
#[derive(Debug, Clone)]
pub struct LeaseOptions {
    pub duration: Duration,
    /// Renewal fires this long before the lease would lapse.
    pub renew_margin: Duration,
    pub attempts: u32,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for LeaseOptions {
    fn default() -> Self {
        Self {
            duration: DEFAULT_LEASE_DURATION,
            renew_margin: RENEW_MARGIN,
            attempts: 3,
            backoff_min: Duration::from_millis(500),
            backoff_max: Duration::from_millis(1_500),
        }
    }
}

impl LeaseOptions {
    pub fn renew_period(&self) -> Duration {
        self.duration
            .checked_sub(self.renew_margin)
            .filter(|p| !p.is_zero())
            .unwrap_or(self.duration / 2)
    }

    /// Random sleep after the `attempt`-th failed try (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let min = self.backoff_min.as_millis() as u64 * u64::from(attempt);
        let max = self.backoff_max.as_millis() as u64 * u64::from(attempt);
        let millis = if max > min {
            rand::rng().random_range(min..=max)
        } else {
            min
        };
        Duration::from_millis(millis)
    }
}

/// Normalizes a lease name to something every object store accepts:
/// lowercase, with separators and whitespace removed.
pub fn blob_safe_name(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '_' | '-' | '/') && !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

fn normalized_key(container: &str, name: &str) -> Result<BlobKey> {
    let container = blob_safe_name(container);
    let name = blob_safe_name(name);
    if container.is_empty() || name.is_empty() {
        return Err(LeaseError::InvalidName(format!("{container}/{name}")));
    }
    Ok(BlobKey::new(container, name))
}

/// Blob-lease backed mutual exclusion.
///
/// At most one [`LeaseHandle`] exists per `(container, name)` across every
/// process sharing the same [`LeaseStore`]. Handles renew themselves in the
/// background until released or dropped.
pub struct DistributedLease {
    store: Arc<dyn LeaseStore>,
    options: LeaseOptions,
    known_blobs: Mutex<HashMap<BlobKey, Arc<OnceCell<()>>>>,
}

impl DistributedLease {
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self::with_options(store, LeaseOptions::default())
    }

    pub fn with_options(store: Arc<dyn LeaseStore>, options: LeaseOptions) -> Self {
        Self {
            store,
            options,
            known_blobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &LeaseOptions {
        &self.options
    }

    pub(crate) fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    /// Tries once to take the lease.
    ///
    /// Returns `Ok(None)` when someone else holds it.
    #[instrument(skip(self))]
    pub async fn obtain(&self, container: &str, name: &str) -> Result<Option<LeaseHandle>> {
        let key = normalized_key(container, name)?;
        self.ensure_blob(&key).await?;
        self.acquire(key, false).await
    }

    /// Like [`obtain`](Self::obtain) but retries with jittered, growing sleeps
    /// before giving up.
    pub async fn try_obtain(&self, container: &str, name: &str) -> Result<Option<LeaseHandle>> {
        let attempts = self.options.attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(handle) = self.obtain(container, name).await? {
                return Ok(Some(handle));
            }
            if attempt < attempts {
                let delay = self.options.backoff(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Lease busy, backing off");
                tokio::time::sleep(delay).await;
            }
        }
        Ok(None)
    }

    /// Creates the container and blob once per key for the lifetime of this value.
    pub(crate) async fn ensure_blob(&self, key: &BlobKey) -> Result<()> {
        let cell = {
            let mut known = self
                .known_blobs
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            known.entry(key.clone()).or_default().clone()
        };

        cell.get_or_try_init(|| async {
            self.store.create_container_if_absent(&key.container).await?;
            self.store.create_blob_if_absent(key, LEASE_BLOB_BODY).await
        })
        .await?;
        Ok(())
    }

    pub(crate) async fn acquire(
        &self,
        key: BlobKey,
        touch_on_release: bool,
    ) -> Result<Option<LeaseHandle>> {
        match self.store.acquire(&key, self.options.duration).await {
            Ok(lease_id) => {
                info!(lease = %key, "Lease acquired");
                Ok(Some(LeaseHandle::start(
                    self.store.clone(),
                    key,
                    lease_id,
                    self.options.renew_period(),
                    touch_on_release,
                )))
            }
            Err(LeaseError::AlreadyPresent(_)) => {
                debug!(lease = %key, "Lease already present");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

struct Renewal {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// A held lease. Release explicitly with [`release`](Self::release) to
/// observe errors; dropping the handle releases on a best-effort basis.
pub struct LeaseHandle {
    store: Arc<dyn LeaseStore>,
    key: BlobKey,
    lease_id: String,
    touch_on_release: bool,
    renewal: Option<Renewal>,
}

impl std::fmt::Debug for LeaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseHandle")
            .field("key", &self.key)
            .field("lease_id", &self.lease_id)
            .finish()
    }
}

impl LeaseHandle {
    fn start(
        store: Arc<dyn LeaseStore>,
        key: BlobKey,
        lease_id: String,
        renew_every: Duration,
        touch_on_release: bool,
    ) -> Self {
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(renew_until_stopped(
            store.clone(),
            key.clone(),
            lease_id.clone(),
            renew_every,
            stopped,
        ));

        Self {
            store,
            key,
            lease_id,
            touch_on_release,
            renewal: Some(Renewal { stop, task }),
        }
    }

    pub fn key(&self) -> &BlobKey {
        &self.key
    }

    pub fn lease_id(&self) -> &str {
        &self.lease_id
    }

    pub(crate) fn without_touch(mut self) -> Self {
        self.touch_on_release = false;
        self
    }

    /// Stops renewal and gives the lease back.
    pub async fn release(mut self) -> Result<()> {
        if let Some(renewal) = self.renewal.take() {
            let _ = renewal.stop.send(());
            let _ = renewal.task.await;
        }
        release_lease(
            self.store.as_ref(),
            &self.key,
            &self.lease_id,
            self.touch_on_release,
        )
        .await
    }
}

impl Drop for LeaseHandle {
    fn drop(&mut self) {
        let Some(renewal) = self.renewal.take() else {
            return;
        };
        let _ = renewal.stop.send(());
        renewal.task.abort();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(lease = %self.key, "No runtime available, lease left to expire");
            return;
        };
        let store = self.store.clone();
        let key = self.key.clone();
        let lease_id = std::mem::take(&mut self.lease_id);
        let touch = self.touch_on_release;
        runtime.spawn(async move {
            if let Err(e) = release_lease(store.as_ref(), &key, &lease_id, touch).await {
                warn!(lease = %key, error = %e, "Best-effort lease release failed");
            }
        });
    }
}

async fn release_lease(
    store: &dyn LeaseStore,
    key: &BlobKey,
    lease_id: &str,
    touch: bool,
) -> Result<()> {
    if touch {
        store.touch(key, lease_id, &Utc::now().to_rfc3339()).await?;
    }
    store.release(key, lease_id).await?;
    info!(lease = %key, "Lease released");
    Ok(())
}

async fn renew_until_stopped(
    store: Arc<dyn LeaseStore>,
    key: BlobKey,
    lease_id: String,
    every: Duration,
    mut stopped: oneshot::Receiver<()>,
) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut renewals: u64 = 0;

    loop {
        tokio::select! {
            _ = &mut stopped => break,
            _ = ticker.tick() => {
                renewals += 1;
                match store.renew(&key, &lease_id).await {
                    Ok(()) => debug!(lease = %key, renewals, "Lease renewed"),
                    Err(e) => warn!(lease = %key, renewals, error = %e, "Lease renewal failed"),
                }
            }
        }
    }
}
