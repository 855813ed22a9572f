use crate::config::Config;
use crate::service::BrokerService;
use crate::tasks::start_reconciler_task;
use anyhow::Result;
use broker_continuation::{run_worker, ContinuationPayload};
use broker_orchestrator::{PoolDefinitionStore, ReconcileSummary};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::info;

/// Runs the background loops until ctrl-c.
pub async fn run(
    service: BrokerService,
    receiver: mpsc::UnboundedReceiver<ContinuationPayload>,
    config: &Config,
) -> Result<()> {
    let workers = tokio::spawn(run_worker(
        service.activator.clone(),
        receiver,
        config.continuation_workers,
    ));
    info!(
        "Continuation workers started ({} concurrent steps)",
        config.continuation_workers
    );

    let reconciler = tokio::spawn(start_reconciler_task(
        service.reconciler.clone(),
        config.reconcile_interval_secs,
    ));
    info!(
        "Reconciler task started (interval: {}s)",
        config.reconcile_interval_secs
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, stopping background tasks");

    reconciler.abort();
    workers.abort();
    service.db.close().await;

    Ok(())
}

/// One sweep, then keeps driving queued follow-ups until the queue has been
/// quiet for `settle`.
pub async fn reconcile_once(
    service: &BrokerService,
    mut receiver: mpsc::UnboundedReceiver<ContinuationPayload>,
    settle: Duration,
) -> Result<ReconcileSummary> {
    let summary = service.reconciler.run().await?;
    info!(
        pools_scanned = summary.pools_scanned,
        orphaned_pools = summary.orphaned_pools,
        deleted = summary.deleted.len(),
        "Orphan pool sweep complete"
    );

    let mut steps = 0usize;
    while let Ok(Some(payload)) = timeout(settle, receiver.recv()).await {
        service.activator.continue_payload(payload).await;
        steps += 1;
    }
    info!(steps, "Continuation queue settled");

    Ok(summary)
}

/// Prints each active pool with its code and unassigned member count.
pub async fn pools(service: &BrokerService) -> Result<()> {
    let definitions = service.pools.retrieve_definitions().await?;
    if definitions.is_empty() {
        println!("No pool definitions configured.");
        return Ok(());
    }

    println!(
        "{:<40}  {:<18}  {:<12}  {:<16}  {:>6}  {:>10}",
        "CODE", "TYPE", "LOCATION", "SKU", "TARGET", "UNASSIGNED"
    );
    for definition in definitions {
        let code = definition.code();
        let unassigned = service.repository.count_unassigned(&code).await?;
        println!(
            "{:<40}  {:<18}  {:<12}  {:<16}  {:>6}  {:>10}",
            code,
            definition.resource_type.as_str(),
            definition.location,
            definition.sku_name,
            definition.target_count,
            unassigned
        );
    }
    Ok(())
}
