//! Watches an environment move from one state to another and repairs it when
//! the move stalls.

use crate::environment::{EnvironmentKind, EnvironmentRecord, EnvironmentRepository, EnvironmentState};
use crate::error::{BrokerError, Result};
use crate::handlers::lifecycle_target;
use crate::provider::LifecycleRequest;
use crate::resource::ResourceOperation;
use async_trait::async_trait;
use broker_continuation::{
    guarded_continue, ContinuationHandler, ContinuationInput, ContinuationPayload,
    ContinuationQueue, ContinuationResult, GuardReasons, NextStageInput, TokenCodec,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

pub const MONITOR_TARGET: &str = "EnvironmentStateTransitionMonitor";

pub const HEALTHY_TRANSITION: &str = "HealthyStateTransition";
pub const HEALTHY_INTERMEDIATE_TRANSITION: &str = "HealthyIntermediateStateTransition";
pub const UNKNOWN_TRANSITION: &str = "UnknownStateTransition";
pub const TRANSITION_TIMEOUT: &str = "TimeoutInStateTransition";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransitionInput {
    pub environment_id: String,
    #[serde(default)]
    pub compute_resource_id: Option<String>,
    pub current_state: EnvironmentState,
    pub target_state: EnvironmentState,
    pub timeout_secs: u64,
}

impl StateTransitionInput {
    pub fn for_environment(
        environment: &EnvironmentRecord,
        target_state: EnvironmentState,
        timeout: Duration,
    ) -> Self {
        Self {
            environment_id: environment.id.clone(),
            compute_resource_id: environment.compute_resource_id.clone(),
            current_state: environment.state,
            target_state,
            timeout_secs: timeout.as_secs(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "stage")]
enum MonitorStage {
    Watching,
}

fn watching_token(environment_id: &str) -> broker_continuation::Result<String> {
    TokenCodec::encode(&NextStageInput::new(MonitorStage::Watching, environment_id))
}

/// Corrective actions taken on a stalled environment.
#[async_trait]
pub trait RepairActions: Send + Sync {
    async fn suspend(&self, environment: &EnvironmentRecord, reason: &str) -> Result<()>;

    /// Suspend without waiting for the environment to shut down cleanly.
    async fn force_suspend(&self, environment: &EnvironmentRecord, reason: &str) -> Result<()>;

    async fn fail(&self, environment: &EnvironmentRecord, reason: &str) -> Result<()>;
}

/// Starts a new monitor lifeline.
#[async_trait]
pub trait MonitorScheduler: Send + Sync {
    /// The scheduled monitor checks once `delay` has passed.
    async fn schedule(&self, input: StateTransitionInput, delay: Duration) -> Result<()>;
}

pub struct QueueMonitorScheduler {
    queue: Arc<dyn ContinuationQueue>,
}

impl QueueMonitorScheduler {
    pub fn new(queue: Arc<dyn ContinuationQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl MonitorScheduler for QueueMonitorScheduler {
    async fn schedule(&self, input: StateTransitionInput, delay: Duration) -> Result<()> {
        let token = watching_token(&input.environment_id)?;
        let body = ContinuationInput::from_body(&input)?.with_token(token);
        self.queue
            .enqueue(ContinuationPayload::new(MONITOR_TARGET, body), delay)
            .await?;
        Ok(())
    }
}

/// Repairs by updating the environment and queueing cleanup of its compute.
pub struct EnvironmentRepairActions {
    environments: Arc<dyn EnvironmentRepository>,
    queue: Arc<dyn ContinuationQueue>,
}

impl EnvironmentRepairActions {
    pub fn new(environments: Arc<dyn EnvironmentRepository>, queue: Arc<dyn ContinuationQueue>) -> Self {
        Self {
            environments,
            queue,
        }
    }

    async fn queue_cleanup(&self, environment: &EnvironmentRecord, reason: &str) -> Result<()> {
        let Some(compute_id) = &environment.compute_resource_id else {
            return Ok(());
        };
        let request = LifecycleRequest::new(compute_id, reason).for_environment(&environment.id);
        let payload = ContinuationPayload::new(
            lifecycle_target(ResourceOperation::Cleanup),
            ContinuationInput::from_body(&request)?,
        );
        self.queue.enqueue(payload, Duration::ZERO).await?;
        Ok(())
    }
}

#[async_trait]
impl RepairActions for EnvironmentRepairActions {
    async fn suspend(&self, environment: &EnvironmentRecord, reason: &str) -> Result<()> {
        self.environments
            .set_state(&environment.id, EnvironmentState::ShuttingDown, reason)
            .await?;
        self.queue_cleanup(environment, reason).await
    }

    async fn force_suspend(&self, environment: &EnvironmentRecord, reason: &str) -> Result<()> {
        self.environments
            .set_state(&environment.id, EnvironmentState::Shutdown, reason)
            .await?;
        self.queue_cleanup(environment, reason).await
    }

    async fn fail(&self, environment: &EnvironmentRecord, reason: &str) -> Result<()> {
        self.environments
            .set_state(&environment.id, EnvironmentState::Failed, reason)
            .await
    }
}

pub struct StateTransitionMonitor {
    enabled: bool,
    environments: Arc<dyn EnvironmentRepository>,
    repairs: Arc<dyn RepairActions>,
    scheduler: Arc<dyn MonitorScheduler>,
    reasons: GuardReasons,
}

impl StateTransitionMonitor {
    pub fn new(
        enabled: bool,
        environments: Arc<dyn EnvironmentRepository>,
        repairs: Arc<dyn RepairActions>,
        scheduler: Arc<dyn MonitorScheduler>,
    ) -> Self {
        Self {
            enabled,
            environments,
            repairs,
            scheduler,
            reasons: GuardReasons::new(
                "EnvironmentMonitoringDisabled",
                "EnvironmentRecordNotFound",
                "EnvironmentResourceChanged",
            ),
        }
    }

    async fn evaluate(
        &self,
        input: &ContinuationInput,
        watch: StateTransitionInput,
        environment: EnvironmentRecord,
    ) -> Result<ContinuationResult> {
        let Some(token) = input.token() else {
            let token = watching_token(&watch.environment_id)?;
            return Ok(ContinuationResult::in_progress(
                input.clone().with_token(token),
                watch.timeout(),
            ));
        };
        TokenCodec::decode::<MonitorStage>(token)?;

        if environment.state == watch.target_state {
            return Ok(ContinuationResult::succeeded_with(HEALTHY_TRANSITION));
        }
        if environment.state != watch.current_state {
            info!(
                environment_id = %environment.id,
                state = %environment.state,
                expected = %watch.target_state,
                "Environment left the watched transition"
            );
            return Ok(ContinuationResult::cancelled(UNKNOWN_TRANSITION));
        }

        warn!(
            environment_id = %environment.id,
            state = %environment.state,
            target = %watch.target_state,
            "Environment state transition timed out"
        );

        if environment.kind == EnvironmentKind::Static {
            return Ok(ContinuationResult::failed(TRANSITION_TIMEOUT));
        }

        match environment.state {
            EnvironmentState::Starting | EnvironmentState::Exporting | EnvironmentState::Updating => {
                self.repairs.suspend(&environment, TRANSITION_TIMEOUT).await?
            }
            EnvironmentState::ShuttingDown => {
                self.repairs
                    .force_suspend(&environment, TRANSITION_TIMEOUT)
                    .await?
            }
            EnvironmentState::Queued if watch.target_state == EnvironmentState::Provisioning => {
                self.repairs.fail(&environment, TRANSITION_TIMEOUT).await?
            }
            EnvironmentState::Queued => {
                self.repairs
                    .force_suspend(&environment, TRANSITION_TIMEOUT)
                    .await?
            }
            EnvironmentState::Provisioning => {
                let now = Utc::now();
                match environment.state_timeout {
                    Some(deadline) if deadline > now => {
                        let remaining = (deadline - now).to_std().unwrap_or_default();
                        let next = StateTransitionInput {
                            timeout_secs: remaining.as_secs(),
                            ..watch
                        };
                        self.scheduler.schedule(next, remaining).await?;
                        return Ok(ContinuationResult::succeeded_with(
                            HEALTHY_INTERMEDIATE_TRANSITION,
                        ));
                    }
                    _ => self.repairs.fail(&environment, TRANSITION_TIMEOUT).await?,
                }
            }
            other => {
                warn!(state = %other, "No repair for stalled state");
                return Ok(ContinuationResult::cancelled(UNKNOWN_TRANSITION));
            }
        }

        Ok(ContinuationResult::failed(TRANSITION_TIMEOUT))
    }
}

#[async_trait]
impl ContinuationHandler for StateTransitionMonitor {
    fn target(&self) -> &str {
        MONITOR_TARGET
    }

    #[instrument(skip_all)]
    async fn resume(
        &self,
        input: &ContinuationInput,
    ) -> broker_continuation::Result<ContinuationResult> {
        let environments = self.environments.clone();
        guarded_continue::<_, _, BrokerError, _, _, _, _, _>(
            input,
            self.enabled,
            &self.reasons,
            |watch: &StateTransitionInput| {
                let id = watch.environment_id.clone();
                async move { environments.get(&id).await }
            },
            |watch: &StateTransitionInput, environment: &EnvironmentRecord| {
                environment.kind == EnvironmentKind::Static
                    || environment.compute_resource_id == watch.compute_resource_id
            },
            |watch, environment| self.evaluate(input, watch, environment),
        )
        .await
        .map_err(Into::into)
    }
}
