use broker_orchestrator::OrphanPoolReconciler;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{error, info};

pub async fn start_reconciler_task(reconciler: Arc<OrphanPoolReconciler>, interval_secs: u64) {
    let mut interval = interval(Duration::from_secs(interval_secs));

    info!(
        "Reconciler task running (sweeps every {} seconds)",
        interval_secs
    );

    loop {
        interval.tick().await;

        match reconciler.run().await {
            Ok(summary) => info!(
                pools_scanned = summary.pools_scanned,
                orphaned_pools = summary.orphaned_pools,
                pools_skipped = summary.pools_skipped,
                deleted = summary.deleted.len(),
                "Orphan pool sweep complete"
            ),
            Err(e) => error!("Orphan pool sweep failed: {}", e),
        }
    }
}
