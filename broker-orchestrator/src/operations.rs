use crate::error::Result;
use crate::handlers::lifecycle_target;
use crate::provider::LifecycleRequest;
use crate::resource::ResourceOperation;
use async_trait::async_trait;
use broker_continuation::{ContinuationActivator, ContinuationInput, ContinuationResult};
use std::sync::Arc;
use tracing::instrument;

/// Lifecycle operations on single resources, each one continuation lifeline.
#[async_trait]
pub trait ResourceContinuations: Send + Sync {
    async fn provision(&self, resource_id: &str, reason: &str) -> Result<ContinuationResult>;

    async fn start(&self, request: LifecycleRequest) -> Result<ContinuationResult>;

    async fn suspend(
        &self,
        resource_id: &str,
        environment_id: Option<&str>,
        reason: &str,
    ) -> Result<ContinuationResult>;

    async fn delete(&self, resource_id: &str, reason: &str) -> Result<ContinuationResult>;
}

/// Runs lifecycle operations through the continuation activator.
pub struct ResourceContinuationOperations {
    activator: Arc<ContinuationActivator>,
}

impl ResourceContinuationOperations {
    pub fn new(activator: Arc<ContinuationActivator>) -> Self {
        Self { activator }
    }

    #[instrument(skip(self, request), fields(resource_id = %request.resource_id))]
    async fn execute(
        &self,
        operation: ResourceOperation,
        request: &LifecycleRequest,
    ) -> Result<ContinuationResult> {
        let input = ContinuationInput::from_body(request)?;
        Ok(self
            .activator
            .execute(&lifecycle_target(operation), input)
            .await?)
    }
}

#[async_trait]
impl ResourceContinuations for ResourceContinuationOperations {
    async fn provision(&self, resource_id: &str, reason: &str) -> Result<ContinuationResult> {
        self.execute(
            ResourceOperation::Provisioning,
            &LifecycleRequest::new(resource_id, reason),
        )
        .await
    }

    async fn start(&self, request: LifecycleRequest) -> Result<ContinuationResult> {
        self.execute(ResourceOperation::Starting, &request).await
    }

    async fn suspend(
        &self,
        resource_id: &str,
        environment_id: Option<&str>,
        reason: &str,
    ) -> Result<ContinuationResult> {
        let mut request = LifecycleRequest::new(resource_id, reason);
        request.environment_id = environment_id.map(str::to_string);
        self.execute(ResourceOperation::Cleanup, &request).await
    }

    async fn delete(&self, resource_id: &str, reason: &str) -> Result<ContinuationResult> {
        self.execute(
            ResourceOperation::Deleting,
            &LifecycleRequest::new(resource_id, reason),
        )
        .await
    }
}
