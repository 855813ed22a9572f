use super::{pop_from_pool, roll_back, AllocationStrategy};
use crate::error::Result;
use crate::pool::PoolDefinitionStore;
use crate::repository::ResourceRepository;
use crate::resource::{AllocateInput, AllocateResult, ResourceType};
use async_trait::async_trait;
use std::sync::Arc;

const SUPPORTED: [ResourceType; 4] = [
    ResourceType::ComputeVm,
    ResourceType::KeyVault,
    ResourceType::StorageArchive,
    ResourceType::StorageFileShare,
];

/// Pops one pooled resource per request.
pub struct BasicStrategy {
    repository: Arc<dyn ResourceRepository>,
    pools: Arc<dyn PoolDefinitionStore>,
}

impl BasicStrategy {
    pub fn new(repository: Arc<dyn ResourceRepository>, pools: Arc<dyn PoolDefinitionStore>) -> Self {
        Self { repository, pools }
    }
}

#[async_trait]
impl AllocationStrategy for BasicStrategy {
    fn name(&self) -> &'static str {
        "basic"
    }

    fn can_handle(&self, inputs: &[AllocateInput]) -> bool {
        !inputs.is_empty() && inputs.iter().all(|i| SUPPORTED.contains(&i.resource_type))
    }

    async fn allocate(
        &self,
        environment_id: &str,
        inputs: &[AllocateInput],
        reason: &str,
    ) -> Result<Vec<AllocateResult>> {
        let mut claimed = Vec::with_capacity(inputs.len());

        for input in inputs {
            match pop_from_pool(
                self.repository.as_ref(),
                self.pools.as_ref(),
                environment_id,
                input,
                reason,
            )
            .await
            {
                Ok(record) => claimed.push(record),
                Err(e) => {
                    roll_back(self.repository.as_ref(), &claimed).await;
                    return Err(e);
                }
            }
        }

        Ok(claimed.iter().map(AllocateResult::from).collect())
    }
}
