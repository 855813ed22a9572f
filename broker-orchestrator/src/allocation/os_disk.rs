use super::{pop_from_pool, roll_back, AllocationStrategy};
use crate::error::{BrokerError, Result};
use crate::pool::PoolDefinitionStore;
use crate::repository::ResourceRepository;
use crate::resource::{AllocateInput, AllocateResult, ResourceRecord, ResourceType};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// A compute paired with its OS disk.
///
/// The compute comes from its warm pool; the disk is recorded as an assigned
/// companion of that compute rather than pooled on its own.
pub struct OsDiskStrategy {
    repository: Arc<dyn ResourceRepository>,
    pools: Arc<dyn PoolDefinitionStore>,
}

impl OsDiskStrategy {
    pub fn new(repository: Arc<dyn ResourceRepository>, pools: Arc<dyn PoolDefinitionStore>) -> Self {
        Self { repository, pools }
    }

    fn split(inputs: &[AllocateInput]) -> Option<(&AllocateInput, &AllocateInput)> {
        let compute = inputs
            .iter()
            .find(|i| i.resource_type == ResourceType::ComputeVm)?;
        let disk = inputs
            .iter()
            .find(|i| i.resource_type == ResourceType::OsDisk)?;
        Some((compute, disk))
    }

    fn companion_disk(compute: &ResourceRecord, disk: &AllocateInput, reason: &str) -> ResourceRecord {
        let now = Utc::now();
        let mut record = compute.clone();
        record.id = Uuid::new_v4().to_string();
        record.resource_type = ResourceType::OsDisk;
        record.sku_name = disk.logical_sku.clone();
        record.component_of = Some(compute.id.clone());
        record.is_ready = true;
        record.is_assigned = true;
        record.assigned = Some(now);
        record.assigned_reason = Some(reason.to_string());
        record.provisioning = Default::default();
        record.starting = Default::default();
        record.deleting = Default::default();
        record.cleanup = Default::default();
        record.created = now;
        record.updated = now;
        record.version = 0;
        record
    }
}

#[async_trait]
impl AllocationStrategy for OsDiskStrategy {
    fn name(&self) -> &'static str {
        "os-disk"
    }

    fn can_handle(&self, inputs: &[AllocateInput]) -> bool {
        let count = |t: ResourceType| inputs.iter().filter(|i| i.resource_type == t).count();
        inputs.len() == 2 && count(ResourceType::ComputeVm) == 1 && count(ResourceType::OsDisk) == 1
    }

    async fn allocate(
        &self,
        environment_id: &str,
        inputs: &[AllocateInput],
        reason: &str,
    ) -> Result<Vec<AllocateResult>> {
        let (compute_input, disk_input) = Self::split(inputs).ok_or_else(|| {
            BrokerError::NotSupported("expected one compute and one OS disk".to_string())
        })?;

        let compute = pop_from_pool(
            self.repository.as_ref(),
            self.pools.as_ref(),
            environment_id,
            compute_input,
            reason,
        )
        .await?;

        let disk = Self::companion_disk(&compute, disk_input, reason);
        if let Err(e) = self.repository.create(&disk).await {
            roll_back(self.repository.as_ref(), std::slice::from_ref(&compute)).await;
            return Err(e);
        }
        debug!(compute_id = %compute.id, disk_id = %disk.id, "Recorded OS disk companion");

        // Results follow the request order.
        Ok(inputs
            .iter()
            .map(|i| match i.resource_type {
                ResourceType::OsDisk => AllocateResult::from(&disk),
                _ => AllocateResult::from(&compute),
            })
            .collect())
    }
}
