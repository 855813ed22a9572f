use crate::config::Config;
use anyhow::{Context, Result};
use broker_continuation::{ContinuationActivator, ContinuationQueue, HandlerRegistry};
use broker_lease::{ClaimedDistributedLease, DistributedLease};
use broker_orchestrator::{
    EnvironmentRepairActions, EnvironmentRepository, OrphanPoolReconciler, QueueMonitorScheduler,
    ResourceAllocator, ResourceBroker, ResourceContinuationOperations, ResourceLifecycleHandler,
    ResourceProvider, ResourceRepository, SqliteEnvironmentRepository, SqliteLeaseStore,
    SqliteResourceRepository, StateTransitionMonitor, StaticPoolDefinitionStore,
    StaticSecretManager,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Loads the configured pool definitions. Without a file the broker starts
/// with no pools, which also keeps the reconciler from deleting anything.
pub fn load_pool_definitions(config: &Config) -> Result<StaticPoolDefinitionStore> {
    match &config.pool_definitions {
        Some(path) => {
            let store = StaticPoolDefinitionStore::from_yaml_file(path).with_context(|| {
                format!("Failed to load pool definitions from {}", path.display())
            })?;
            info!(path = %path.display(), pools = store.len(), "Pool definitions loaded");
            Ok(store)
        }
        None => {
            warn!("No pool definitions configured, orphan reconciliation will skip every sweep");
            Ok(StaticPoolDefinitionStore::new(Vec::new())?)
        }
    }
}

/// Everything one worker process runs, wired over a single database.
pub struct BrokerService {
    pub db: SqlitePool,
    pub pools: Arc<StaticPoolDefinitionStore>,
    pub repository: Arc<dyn ResourceRepository>,
    pub environments: Arc<dyn EnvironmentRepository>,
    pub activator: Arc<ContinuationActivator>,
    pub broker: ResourceBroker,
    pub reconciler: Arc<OrphanPoolReconciler>,
}

impl BrokerService {
    pub fn new(
        config: &Config,
        db: SqlitePool,
        pools: Arc<StaticPoolDefinitionStore>,
        provider: Arc<dyn ResourceProvider>,
        queue: Arc<dyn ContinuationQueue>,
    ) -> Self {
        let repository = SqliteResourceRepository::shared(db.clone());
        let environments = SqliteEnvironmentRepository::shared(db.clone());

        let monitor = StateTransitionMonitor::new(
            config.monitoring_enabled,
            environments.clone(),
            Arc::new(EnvironmentRepairActions::new(
                environments.clone(),
                queue.clone(),
            )),
            Arc::new(QueueMonitorScheduler::new(queue.clone())),
        );
        let registry = ResourceLifecycleHandler::all(repository.clone(), provider)
            .into_iter()
            .fold(
                HandlerRegistry::new().register(Arc::new(monitor)),
                |registry, handler| registry.register(handler),
            );
        info!(targets = ?registry.targets(), "Continuation handlers registered");

        let activator = Arc::new(ContinuationActivator::new(registry, queue));
        let continuations = Arc::new(ResourceContinuationOperations::new(activator.clone()));

        let broker = ResourceBroker::new(
            ResourceAllocator::standard(repository.clone(), pools.clone()),
            repository.clone(),
            continuations.clone(),
            Arc::new(StaticSecretManager::default()),
        );

        let leases = Arc::new(DistributedLease::new(Arc::new(SqliteLeaseStore::new(
            db.clone(),
        ))));
        let reconciler = OrphanPoolReconciler::new(
            repository.clone(),
            pools.clone(),
            continuations,
            ClaimedDistributedLease::new(leases),
            config.lease_container.clone(),
        )
        .with_claim_span(Duration::from_secs(config.reconcile_interval_secs));

        Self {
            db,
            pools,
            repository,
            environments,
            activator,
            broker,
            reconciler: Arc::new(reconciler),
        }
    }
}
