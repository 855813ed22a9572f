//! Provider that only pretends to talk to a cloud, for local runs.

use async_trait::async_trait;
use broker_continuation::{NextStageInput, ProviderStep, Result};
use broker_orchestrator::{
    LifecycleRequest, LifecycleStage, ResourceOperation, ResourceProvider, ResourceRecord,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

type Submissions = HashMap<(ResourceOperation, String), String>;

/// Completes every operation after a fixed number of polls.
///
/// Submitting the same operation for the same resource again while the first
/// is in flight returns the first submission's tracking id.
pub struct SimulatedProvider {
    polls: u32,
    poll_interval: Duration,
    submitted: Mutex<Submissions>,
    sequence: Mutex<u64>,
}

impl SimulatedProvider {
    pub fn new(polls: u32, poll_interval: Duration) -> Self {
        Self {
            polls: polls.max(1),
            poll_interval,
            submitted: Mutex::new(HashMap::new()),
            sequence: Mutex::new(0),
        }
    }

    /// Operations submitted but not yet reported complete.
    pub fn in_flight(&self) -> usize {
        self.submissions().len()
    }

    fn submissions(&self) -> MutexGuard<'_, Submissions> {
        self.submitted.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_tracking_id(&self, operation: ResourceOperation) -> String {
        let mut sequence = self.sequence.lock().unwrap_or_else(|e| e.into_inner());
        *sequence += 1;
        format!("sim-{}-{:06}", operation.as_str(), *sequence)
    }
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new(2, Duration::from_secs(1))
    }
}

#[async_trait]
impl ResourceProvider for SimulatedProvider {
    async fn begin(
        &self,
        operation: ResourceOperation,
        record: &ResourceRecord,
        request: &LifecycleRequest,
    ) -> Result<ProviderStep<LifecycleStage>> {
        let tracking_id = self
            .submissions()
            .entry((operation, record.id.clone()))
            .or_insert_with(|| self.next_tracking_id(operation))
            .clone();

        info!(
            resource_id = %record.id,
            operation = %operation,
            tracking_id = %tracking_id,
            reason = %request.reason,
            "Simulated provider accepted request"
        );
        Ok(ProviderStep::in_progress(
            NextStageInput::new(LifecycleStage::Submitted, &record.id)
                .with_tracking_id(tracking_id),
        ))
    }

    async fn check(
        &self,
        operation: ResourceOperation,
        record: &ResourceRecord,
        next: NextStageInput<LifecycleStage>,
    ) -> Result<ProviderStep<LifecycleStage>> {
        let polls = match next.stage {
            LifecycleStage::Checking { polls } => polls + 1,
            _ => 1,
        };
        debug!(resource_id = %record.id, operation = %operation, polls, "Simulated provider poll");

        let next = next.advance(LifecycleStage::Checking { polls });
        if polls < self.polls {
            return Ok(ProviderStep::in_progress(next));
        }

        self.submissions().remove(&(operation, record.id.clone()));
        Ok(ProviderStep::succeeded(next))
    }

    fn retry_after(&self, _operation: ResourceOperation) -> Duration {
        self.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_continuation::OperationState;
    use broker_orchestrator::test_utils::definition;
    use broker_orchestrator::ResourceType;
    use futures_util::future::join_all;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn record() -> ResourceRecord {
        ResourceRecord::new_pooled(&definition(ResourceType::ComputeVm, "WestUs2"))
    }

    #[tokio::test]
    async fn test_begin_is_idempotent_while_in_flight() {
        let provider = SimulatedProvider::new(1, Duration::ZERO);
        let record = record();
        let request = LifecycleRequest::new(&record.id, "UserRequest");

        let first = provider
            .begin(ResourceOperation::Deleting, &record, &request)
            .await
            .expect("Failed to begin");
        let second = provider
            .begin(ResourceOperation::Deleting, &record, &request)
            .await
            .expect("Failed to begin");
        assert_eq!(first.next.tracking_id, second.next.tracking_id);
        assert_eq!(provider.in_flight(), 1);

        let done = provider
            .check(ResourceOperation::Deleting, &record, first.next.clone())
            .await
            .expect("Failed to check");
        assert_eq!(done.state, OperationState::Succeeded);
        assert_eq!(provider.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_begins_share_one_submission() {
        let provider = Arc::new(SimulatedProvider::new(1, Duration::ZERO));
        let record = Arc::new(record());

        let begins = (0..16).map(|_| {
            let provider = provider.clone();
            let record = record.clone();
            tokio::spawn(async move {
                let request = LifecycleRequest::new(&record.id, "UserRequest");
                provider
                    .begin(ResourceOperation::Provisioning, &record, &request)
                    .await
                    .expect("Failed to begin")
                    .next
                    .tracking_id
            })
        });
        let ids: HashSet<_> = join_all(begins)
            .await
            .into_iter()
            .map(|r| r.expect("Begin task panicked"))
            .collect();

        assert_eq!(ids.len(), 1);
        assert_eq!(provider.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_check_polls_until_done() {
        let provider = SimulatedProvider::new(3, Duration::from_millis(5));
        let record = record();
        let mut next = NextStageInput::new(LifecycleStage::Submitted, &record.id);

        for _ in 0..2 {
            let step = provider
                .check(ResourceOperation::Provisioning, &record, next)
                .await
                .expect("Failed to check");
            assert_eq!(step.state, OperationState::InProgress);
            next = step.next;
        }
        let step = provider
            .check(ResourceOperation::Provisioning, &record, next)
            .await
            .expect("Failed to check");
        assert_eq!(step.state, OperationState::Succeeded);
        assert_eq!(step.next.stage, LifecycleStage::Checking { polls: 3 });
        assert_eq!(
            provider.retry_after(ResourceOperation::Provisioning),
            Duration::from_millis(5)
        );
    }
}
