use crate::error::{BrokerError, Result};
use crate::provider::{LifecycleRequest, LifecycleStage, ResourceProvider};
use crate::repository::{mutate_with_retry, ResourceRepository};
use crate::resource::{PhaseStatus, ResourceOperation, ResourceRecord};
use async_trait::async_trait;
use broker_continuation::{
    guarded_continue, run_operation, ContinuationError, ContinuationHandler, ContinuationInput,
    ContinuationResult, GuardReasons, NextStageInput, OperationState, ProviderOperation,
    ProviderStep,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

/// Queue target for a lifecycle operation.
pub fn lifecycle_target(operation: ResourceOperation) -> String {
    format!("ResourceLifecycle-{operation}")
}

/// Drives one lifecycle operation of a resource through its provider and
/// mirrors progress into the record's phase status.
pub struct ResourceLifecycleHandler {
    operation: ResourceOperation,
    target: String,
    repository: Arc<dyn ResourceRepository>,
    provider: Arc<dyn ResourceProvider>,
    reasons: GuardReasons,
}

impl ResourceLifecycleHandler {
    pub fn new(
        operation: ResourceOperation,
        repository: Arc<dyn ResourceRepository>,
        provider: Arc<dyn ResourceProvider>,
    ) -> Self {
        Self {
            operation,
            target: lifecycle_target(operation),
            repository,
            provider,
            reasons: GuardReasons::new(
                "ResourceLifecycleDisabled",
                "ResourceRecordNotFound",
                "ResourceReassigned",
            ),
        }
    }

    /// One handler per lifecycle operation, ready for registration.
    pub fn all(
        repository: Arc<dyn ResourceRepository>,
        provider: Arc<dyn ResourceProvider>,
    ) -> Vec<Arc<dyn ContinuationHandler>> {
        ResourceOperation::ALL
            .into_iter()
            .map(|op| {
                Arc::new(Self::new(op, repository.clone(), provider.clone()))
                    as Arc<dyn ContinuationHandler>
            })
            .collect()
    }

    async fn step(
        &self,
        input: &ContinuationInput,
        request: LifecycleRequest,
        record: ResourceRecord,
    ) -> Result<ContinuationResult> {
        if input.token().is_none() {
            info!(resource_id = %record.id, operation = %self.operation, "Starting lifecycle operation");
            self.record_phase(&record.id, PhaseStatus::Initialized, Some(request.reason.clone()))
                .await?;
        }

        let operation = LifecycleOperation {
            provider: self.provider.as_ref(),
            operation: self.operation,
            record: &record,
            request: &request,
        };

        let result = match run_operation(&operation, input).await {
            Ok(result) => result,
            Err(ContinuationError::OperationFailed { detail }) => ContinuationResult::failed(detail),
            Err(e) => return Err(e.into()),
        };

        let status = match result.status() {
            OperationState::InProgress => PhaseStatus::InProgress,
            OperationState::Succeeded => PhaseStatus::Succeeded,
            OperationState::Failed => PhaseStatus::Failed,
            OperationState::Cancelled => PhaseStatus::Cancelled,
        };
        let reason = result
            .error_reason()
            .map(str::to_string)
            .unwrap_or(request.reason);
        self.record_phase(&record.id, status, Some(reason)).await?;

        Ok(result)
    }

    async fn record_phase(
        &self,
        resource_id: &str,
        status: PhaseStatus,
        reason: Option<String>,
    ) -> Result<()> {
        let operation = self.operation;
        mutate_with_retry(self.repository.as_ref(), resource_id, move |record| {
            record.phase_mut(operation).set(status, reason.clone());
            if status == PhaseStatus::Succeeded {
                match operation {
                    ResourceOperation::Provisioning => record.is_ready = true,
                    ResourceOperation::Deleting => record.mark_deleted(),
                    ResourceOperation::Starting | ResourceOperation::Cleanup => {}
                }
            }
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ContinuationHandler for ResourceLifecycleHandler {
    fn target(&self) -> &str {
        &self.target
    }

    #[instrument(skip_all, fields(target = %self.target))]
    async fn resume(
        &self,
        input: &ContinuationInput,
    ) -> broker_continuation::Result<ContinuationResult> {
        let repository = self.repository.clone();
        guarded_continue::<_, _, BrokerError, _, _, _, _, _>(
            input,
            true,
            &self.reasons,
            |request: &LifecycleRequest| {
                let id = request.resource_id.clone();
                async move { Ok(repository.get(&id).await?.filter(|r| !r.is_deleted)) }
            },
            |request: &LifecycleRequest, record: &ResourceRecord| match &request.environment_id {
                Some(environment_id) => record.environment_id.as_ref() == Some(environment_id),
                None => true,
            },
            |request, record| self.step(input, request, record),
        )
        .await
        .map_err(Into::into)
    }
}

/// Adapts a [`ResourceProvider`] call for one record to the engine.
struct LifecycleOperation<'a> {
    provider: &'a dyn ResourceProvider,
    operation: ResourceOperation,
    record: &'a ResourceRecord,
    request: &'a LifecycleRequest,
}

#[async_trait]
impl ProviderOperation for LifecycleOperation<'_> {
    type Stage = LifecycleStage;

    async fn begin(
        &self,
        _input: &ContinuationInput,
    ) -> broker_continuation::Result<ProviderStep<LifecycleStage>> {
        self.provider
            .begin(self.operation, self.record, self.request)
            .await
    }

    async fn check(
        &self,
        next: NextStageInput<LifecycleStage>,
    ) -> broker_continuation::Result<ProviderStep<LifecycleStage>> {
        if next.resource_id != self.record.id {
            return Err(ContinuationError::InvalidInput(format!(
                "token is for resource {} but request names {}",
                next.resource_id, self.record.id
            )));
        }
        self.provider.check(self.operation, self.record, next).await
    }

    fn retry_after(&self) -> Duration {
        self.provider.retry_after(self.operation)
    }
}
