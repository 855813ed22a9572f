//! Leases that can be won at most once per claim period.
//!
//! The period start is the current time rounded down to a multiple of the
//! claim span, counted from midnight UTC. A holder that finishes touches the
//! blob on release, so later callers in the same period see a last-modified
//! time inside the period and back off.

use crate::error::Result;
use crate::lease::{DistributedLease, LeaseHandle};
use crate::store::BlobKey;
use crate::LeaseError;
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Start of the claim period containing `now`.
pub fn claim_period_start(now: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    let span_secs = span.as_secs().max(1);
    let since_midnight = u64::from(now.num_seconds_from_midnight());
    let period_secs = (since_midnight / span_secs) * span_secs;
    let midnight = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or(now);
    midnight + ChronoDuration::seconds(period_secs as i64)
}

pub struct ClaimedDistributedLease {
    lease: Arc<DistributedLease>,
}

impl ClaimedDistributedLease {
    pub fn new(lease: Arc<DistributedLease>) -> Self {
        Self { lease }
    }

    /// Obtains the lease unless it was already claimed in the current period.
    pub async fn obtain(
        &self,
        container: &str,
        name: &str,
        claim_span: Duration,
    ) -> Result<Option<LeaseHandle>> {
        self.obtain_at(container, name, claim_span, Utc::now()).await
    }

    #[instrument(skip(self))]
    pub async fn obtain_at(
        &self,
        container: &str,
        name: &str,
        claim_span: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<LeaseHandle>> {
        let container = crate::blob_safe_name(container);
        let name = crate::blob_safe_name(name);
        if container.is_empty() || name.is_empty() {
            return Err(LeaseError::InvalidName(format!("{container}/{name}")));
        }
        let key = BlobKey::new(container, name);
        let period_start = claim_period_start(now, claim_span);
        let store = self.lease.store().clone();

        let first_run = match store.last_modified(&key).await? {
            Some(modified) if modified >= period_start => {
                debug!(lease = %key, %period_start, "Already claimed this period");
                return Ok(None);
            }
            Some(_) => false,
            None => true,
        };

        self.lease.ensure_blob(&key).await?;
        let Some(handle) = self.lease.acquire(key.clone(), true).await? else {
            return Ok(None);
        };

        // Someone may have finished a claim between the check and the acquire.
        if !first_run {
            let claimed = store
                .last_modified(&key)
                .await?
                .is_some_and(|modified| modified >= period_start);
            if claimed {
                debug!(lease = %key, "Claimed by another holder during acquire");
                handle.without_touch().release().await?;
                return Ok(None);
            }
        }

        Ok(Some(handle))
    }
}
