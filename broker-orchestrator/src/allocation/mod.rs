//! Strategy-based allocation from warm pools.

mod basic;
mod os_disk;

pub use basic::BasicStrategy;
pub use os_disk::OsDiskStrategy;

use crate::error::{BrokerError, Result};
use crate::pool::PoolDefinitionStore;
use crate::repository::ResourceRepository;
use crate::resource::{AllocateInput, AllocateResult, ResourceRecord};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Handles one shape of allocation batch.
#[async_trait]
pub trait AllocationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_handle(&self, inputs: &[AllocateInput]) -> bool;

    /// Allocates the whole batch or nothing.
    async fn allocate(
        &self,
        environment_id: &str,
        inputs: &[AllocateInput],
        reason: &str,
    ) -> Result<Vec<AllocateResult>>;
}

/// Routes each batch to the single strategy that claims it.
pub struct ResourceAllocator {
    strategies: Vec<Arc<dyn AllocationStrategy>>,
}

impl ResourceAllocator {
    pub fn new(strategies: Vec<Arc<dyn AllocationStrategy>>) -> Self {
        Self { strategies }
    }

    /// The basic and OS-disk strategies over one repository.
    pub fn standard(
        repository: Arc<dyn ResourceRepository>,
        pools: Arc<dyn PoolDefinitionStore>,
    ) -> Self {
        Self::new(vec![
            Arc::new(BasicStrategy::new(repository.clone(), pools.clone())),
            Arc::new(OsDiskStrategy::new(repository, pools)),
        ])
    }

    #[instrument(skip(self, inputs), fields(batch = inputs.len()))]
    pub async fn allocate(
        &self,
        environment_id: &str,
        inputs: &[AllocateInput],
        reason: &str,
    ) -> Result<Vec<AllocateResult>> {
        if inputs.is_empty() {
            return Err(BrokerError::InvalidInput(
                "allocation batch is empty".to_string(),
            ));
        }

        let mut claiming = self.strategies.iter().filter(|s| s.can_handle(inputs));
        let strategy = match (claiming.next(), claiming.next()) {
            (Some(strategy), None) => strategy,
            (None, _) => {
                return Err(BrokerError::Configuration("Inputs not supported.".to_string()))
            }
            (Some(first), Some(second)) => {
                return Err(BrokerError::Configuration(format!(
                    "allocation strategies '{}' and '{}' both claim the batch",
                    first.name(),
                    second.name()
                )))
            }
        };

        let results = strategy.allocate(environment_id, inputs, reason).await?;
        info!(
            strategy = strategy.name(),
            environment_id,
            allocated = results.len(),
            "Allocation complete"
        );
        Ok(results)
    }
}

/// Resolves the request's pool and claims one member of it.
pub(crate) async fn pop_from_pool(
    repository: &dyn ResourceRepository,
    pools: &dyn PoolDefinitionStore,
    environment_id: &str,
    input: &AllocateInput,
    reason: &str,
) -> Result<ResourceRecord> {
    let definition = pools.map_logical_sku(input).await?.ok_or_else(|| {
        BrokerError::InvalidInput(format!(
            "unknown logical sku '{}' for {} in {}",
            input.logical_sku, input.resource_type, input.location
        ))
    })?;

    let pool_code = definition.code();
    repository
        .try_get(&pool_code, environment_id, reason)
        .await?
        .ok_or_else(|| {
            warn!(
                pool_code = %pool_code,
                sku = %input.logical_sku,
                location = %input.location,
                "Pool exhausted"
            );
            BrokerError::OutOfCapacity {
                sku: input.logical_sku.clone(),
                resource_type: input.resource_type,
                location: input.location.clone(),
            }
        })
}

/// Puts already-claimed records back after a batch fails part-way.
pub(crate) async fn roll_back(repository: &dyn ResourceRepository, claimed: &[ResourceRecord]) {
    for record in claimed {
        if let Err(e) = repository.release_get(&record.id).await {
            warn!(resource_id = %record.id, error = %e, "Failed to return resource to pool");
        }
    }
}
