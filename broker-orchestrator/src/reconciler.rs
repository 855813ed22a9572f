//! Deletes unassigned resources whose pool definition no longer exists.

use crate::error::Result;
use crate::operations::ResourceContinuations;
use crate::pool::{PoolDefinitionStore, ResourcePoolDefinition};
use crate::repository::ResourceRepository;
use broker_continuation::OperationState;
use broker_lease::ClaimedDistributedLease;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

pub const ORPHANED_POOL_REASON: &str = "OrphanedPoolResource";

/// Pause between record deletions within one pool.
pub const RECORD_DELAY: Duration = Duration::from_millis(250);

pub const DEFAULT_CLAIM_SPAN: Duration = Duration::from_secs(5 * 60);

/// True when `code` belongs to one of the current definitions.
pub fn is_active_pool(code: &str, definitions: &[ResourcePoolDefinition]) -> bool {
    definitions.iter().any(|d| d.code() == code)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub pools_scanned: usize,
    pub orphaned_pools: usize,
    /// Orphaned pools another worker already claimed this period.
    pub pools_skipped: usize,
    pub deleted: Vec<String>,
}

pub struct OrphanPoolReconciler {
    repository: Arc<dyn ResourceRepository>,
    pools: Arc<dyn PoolDefinitionStore>,
    continuations: Arc<dyn ResourceContinuations>,
    lease: ClaimedDistributedLease,
    container: String,
    claim_span: Duration,
    record_delay: Duration,
}

impl OrphanPoolReconciler {
    pub fn new(
        repository: Arc<dyn ResourceRepository>,
        pools: Arc<dyn PoolDefinitionStore>,
        continuations: Arc<dyn ResourceContinuations>,
        lease: ClaimedDistributedLease,
        container: impl Into<String>,
    ) -> Self {
        Self {
            repository,
            pools,
            continuations,
            lease,
            container: container.into(),
            claim_span: DEFAULT_CLAIM_SPAN,
            record_delay: RECORD_DELAY,
        }
    }

    pub fn with_claim_span(mut self, claim_span: Duration) -> Self {
        self.claim_span = claim_span;
        self
    }

    pub fn with_record_delay(mut self, record_delay: Duration) -> Self {
        self.record_delay = record_delay;
        self
    }

    /// One sweep over every pool that still has unassigned members.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();

        let definitions = self.pools.retrieve_definitions().await?;
        if definitions.is_empty() {
            // Treated as a load failure, never as every pool being retired.
            warn!("No active pool definitions, skipping orphan sweep");
            return Ok(summary);
        }

        for code in self.repository.pool_codes_for_unassigned().await? {
            summary.pools_scanned += 1;
            if is_active_pool(&code, &definitions) {
                continue;
            }

            let name = format!("watch-orphaned-pool-{code}");
            let Some(handle) = self
                .lease
                .obtain(&self.container, &name, self.claim_span)
                .await?
            else {
                debug!(pool_code = %code, "Orphaned pool claimed elsewhere");
                summary.pools_skipped += 1;
                continue;
            };

            summary.orphaned_pools += 1;
            let deleted = self.process_pool_records(&code).await;
            if let Err(e) = handle.release().await {
                warn!(pool_code = %code, error = %e, "Failed to release orphan lease");
            }
            summary.deleted.extend(deleted?);
        }

        info!(
            pools_scanned = summary.pools_scanned,
            orphaned_pools = summary.orphaned_pools,
            deleted = summary.deleted.len(),
            "Orphan sweep complete"
        );
        Ok(summary)
    }

    /// Deletes the unassigned members of one orphaned pool.
    pub async fn process_pool_records(&self, pool_code: &str) -> Result<Vec<String>> {
        let ids = self.repository.unassigned_in_pool(pool_code).await?;
        info!(pool_code, count = ids.len(), "Deleting orphaned pool resources");

        let mut deleted = Vec::new();
        for (i, id) in ids.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.record_delay).await;
            }
            match self.delete_resource(id).await {
                Ok(Some(id)) => deleted.push(id),
                Ok(None) => {}
                Err(e) => error!(resource_id = %id, error = %e, "Failed to delete orphaned resource"),
            }
        }
        Ok(deleted)
    }

    /// Deletes the record if it is still an unassigned member of an inactive
    /// pool. Returns its id when a delete was started.
    #[instrument(skip(self))]
    pub async fn delete_resource(&self, id: &str) -> Result<Option<String>> {
        let Some(record) = self.repository.get(id).await? else {
            return Ok(None);
        };
        if record.is_assigned || record.is_deleted {
            debug!(resource_id = id, "Resource no longer an orphan candidate");
            return Ok(None);
        }

        let definitions = self.pools.retrieve_definitions().await?;
        if is_active_pool(&record.pool_reference.code, &definitions) {
            debug!(resource_id = id, "Pool became active again");
            return Ok(None);
        }

        let result = self.continuations.delete(id, ORPHANED_POOL_REASON).await?;
        match result.status() {
            OperationState::InProgress | OperationState::Succeeded => Ok(Some(record.id)),
            status => {
                warn!(resource_id = id, %status, reason = ?result.reason(), "Orphan delete did not start");
                Ok(None)
            }
        }
    }
}
