//! Integration tests for the environment state-transition monitor.

use broker_continuation::{ContinuationHandler, ContinuationInput, ContinuationResult, OperationState};
use broker_orchestrator::test_utils::{create_test_db, RecordingQueue};
use broker_orchestrator::{
    lifecycle_target, EnvironmentKind, EnvironmentRecord, EnvironmentRepairActions,
    EnvironmentRepository, EnvironmentState, LifecycleRequest, QueueMonitorScheduler,
    ResourceOperation, SqliteEnvironmentRepository, StateTransitionInput, StateTransitionMonitor,
    MONITOR_TARGET,
};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(600);

struct Fixture {
    environments: Arc<dyn EnvironmentRepository>,
    queue: Arc<RecordingQueue>,
    monitor: StateTransitionMonitor,
}

async fn fixture(enabled: bool) -> Fixture {
    let db = create_test_db().await;
    let environments = SqliteEnvironmentRepository::shared(db);
    let queue = Arc::new(RecordingQueue::new());
    let monitor = StateTransitionMonitor::new(
        enabled,
        environments.clone(),
        Arc::new(EnvironmentRepairActions::new(
            environments.clone(),
            queue.clone(),
        )),
        Arc::new(QueueMonitorScheduler::new(queue.clone())),
    );
    Fixture {
        environments,
        queue,
        monitor,
    }
}

async fn environment(f: &Fixture, state: EnvironmentState) -> EnvironmentRecord {
    let mut record = EnvironmentRecord::new("dev-box", state);
    record.compute_resource_id = Some("vm-1".to_string());
    f.environments
        .create(&record)
        .await
        .expect("Failed to create environment");
    record
}

fn input(watch: &StateTransitionInput) -> ContinuationInput {
    ContinuationInput::from_body(watch).expect("Failed to build input")
}

/// Runs the first step and returns the input for the timed-out check.
async fn first_step(f: &Fixture, watch: &StateTransitionInput) -> ContinuationInput {
    let first = f
        .monitor
        .resume(&input(watch))
        .await
        .expect("First step failed");
    assert_eq!(first.status(), OperationState::InProgress);
    assert_eq!(first.retry_after(), watch.timeout());
    first.into_next_input().expect("Monitor should continue")
}

async fn check(f: &Fixture, watch: &StateTransitionInput) -> ContinuationResult {
    let next = first_step(f, watch).await;
    assert!(next.token().is_some());
    f.monitor.resume(&next).await.expect("Check step failed")
}

async fn state_of(f: &Fixture, id: &str) -> EnvironmentState {
    f.environments
        .get(id)
        .await
        .expect("Failed to read environment")
        .expect("Environment should exist")
        .state
}

#[tokio::test]
async fn test_reaching_target_is_healthy() {
    let f = fixture(true).await;
    let env = environment(&f, EnvironmentState::Starting).await;
    let watch = StateTransitionInput::for_environment(&env, EnvironmentState::Available, TIMEOUT);

    let next = first_step(&f, &watch).await;
    f.environments
        .set_state(&env.id, EnvironmentState::Available, "Started")
        .await
        .unwrap();

    let result = f.monitor.resume(&next).await.expect("Check step failed");
    assert_eq!(result.status(), OperationState::Succeeded);
    assert_eq!(result.reason(), Some("HealthyStateTransition"));
    assert!(f.queue.is_empty());
}

#[tokio::test]
async fn test_unexpected_state_is_unknown_transition() {
    let f = fixture(true).await;
    let env = environment(&f, EnvironmentState::Starting).await;
    let watch = StateTransitionInput::for_environment(&env, EnvironmentState::Available, TIMEOUT);

    let next = first_step(&f, &watch).await;
    f.environments
        .set_state(&env.id, EnvironmentState::Deleted, "UserDelete")
        .await
        .unwrap();

    let result = f.monitor.resume(&next).await.expect("Check step failed");
    assert_eq!(result.status(), OperationState::Cancelled);
    assert_eq!(result.error_reason(), Some("UnknownStateTransition"));
}

#[tokio::test]
async fn test_provisioning_timeout_fails_environment() {
    let f = fixture(true).await;
    let mut env = EnvironmentRecord::new("dev-box", EnvironmentState::Provisioning);
    env.compute_resource_id = Some("vm-1".to_string());
    env.state_timeout = Some(Utc::now() - ChronoDuration::minutes(5));
    f.environments.create(&env).await.unwrap();
    let watch = StateTransitionInput::for_environment(&env, EnvironmentState::Available, TIMEOUT);

    let result = check(&f, &watch).await;
    assert_eq!(result.status(), OperationState::Failed);
    assert_eq!(result.error_reason(), Some("TimeoutInStateTransition"));

    let stored = f.environments.get(&env.id).await.unwrap().unwrap();
    assert_eq!(stored.state, EnvironmentState::Failed);
    assert_eq!(stored.last_state_reason.as_deref(), Some("TimeoutInStateTransition"));
}

#[tokio::test]
async fn test_provisioning_without_deadline_fails_environment() {
    let f = fixture(true).await;
    let env = environment(&f, EnvironmentState::Provisioning).await;
    let watch = StateTransitionInput::for_environment(&env, EnvironmentState::Available, TIMEOUT);

    let result = check(&f, &watch).await;
    assert_eq!(result.error_reason(), Some("TimeoutInStateTransition"));
    assert_eq!(state_of(&f, &env.id).await, EnvironmentState::Failed);
}

#[tokio::test]
async fn test_provisioning_before_deadline_reschedules() {
    let f = fixture(true).await;
    let mut env = EnvironmentRecord::new("dev-box", EnvironmentState::Provisioning);
    env.compute_resource_id = Some("vm-1".to_string());
    env.state_timeout = Some(Utc::now() + ChronoDuration::hours(1));
    f.environments.create(&env).await.unwrap();
    let watch = StateTransitionInput::for_environment(&env, EnvironmentState::Available, TIMEOUT);

    let result = check(&f, &watch).await;
    assert_eq!(result.status(), OperationState::Succeeded);
    assert_eq!(result.reason(), Some("HealthyIntermediateStateTransition"));
    assert_eq!(state_of(&f, &env.id).await, EnvironmentState::Provisioning);

    let queued = f.queue.take();
    assert_eq!(queued.len(), 1);
    let (payload, delay) = &queued[0];
    assert_eq!(payload.target, MONITOR_TARGET);
    assert_eq!(payload.step_count, 0);
    assert!(payload.input.token().is_some());
    assert!(*delay > Duration::from_secs(3500) && *delay <= Duration::from_secs(3600));

    let rescheduled: StateTransitionInput = payload.input.typed_body().unwrap();
    assert_eq!(rescheduled.environment_id, env.id);
    assert_eq!(rescheduled.target_state, EnvironmentState::Available);
}

#[tokio::test]
async fn test_starting_timeout_suspends() {
    let f = fixture(true).await;
    let env = environment(&f, EnvironmentState::Starting).await;
    let watch = StateTransitionInput::for_environment(&env, EnvironmentState::Available, TIMEOUT);

    let result = check(&f, &watch).await;
    assert_eq!(result.status(), OperationState::Failed);
    assert_eq!(state_of(&f, &env.id).await, EnvironmentState::ShuttingDown);

    let queued = f.queue.take();
    assert_eq!(queued.len(), 1);
    let (payload, _) = &queued[0];
    assert_eq!(payload.target, lifecycle_target(ResourceOperation::Cleanup));
    let request: LifecycleRequest = payload.input.typed_body().unwrap();
    assert_eq!(request.resource_id, "vm-1");
    assert_eq!(request.environment_id.as_deref(), Some(env.id.as_str()));
}

#[tokio::test]
async fn test_shutting_down_timeout_forces_shutdown() {
    let f = fixture(true).await;
    let env = environment(&f, EnvironmentState::ShuttingDown).await;
    let watch = StateTransitionInput::for_environment(&env, EnvironmentState::Shutdown, TIMEOUT);

    let result = check(&f, &watch).await;
    assert_eq!(result.error_reason(), Some("TimeoutInStateTransition"));
    assert_eq!(state_of(&f, &env.id).await, EnvironmentState::Shutdown);
    assert_eq!(f.queue.len(), 1);
}

#[tokio::test]
async fn test_queued_timeout_depends_on_target() {
    let f = fixture(true).await;

    let env = environment(&f, EnvironmentState::Queued).await;
    let watch = StateTransitionInput::for_environment(&env, EnvironmentState::Provisioning, TIMEOUT);
    check(&f, &watch).await;
    assert_eq!(state_of(&f, &env.id).await, EnvironmentState::Failed);

    let env = environment(&f, EnvironmentState::Queued).await;
    let watch = StateTransitionInput::for_environment(&env, EnvironmentState::Starting, TIMEOUT);
    check(&f, &watch).await;
    assert_eq!(state_of(&f, &env.id).await, EnvironmentState::Shutdown);
}

#[tokio::test]
async fn test_stalled_state_without_repair_is_unknown_transition() {
    let f = fixture(true).await;
    let env = environment(&f, EnvironmentState::Available).await;
    let watch = StateTransitionInput::for_environment(&env, EnvironmentState::Shutdown, TIMEOUT);

    let result = check(&f, &watch).await;
    assert_eq!(result.status(), OperationState::Cancelled);
    assert_eq!(result.error_reason(), Some("UnknownStateTransition"));
    assert_eq!(state_of(&f, &env.id).await, EnvironmentState::Available);
    assert!(f.queue.is_empty());
}

#[tokio::test]
async fn test_static_environment_timeout_is_not_repaired() {
    let f = fixture(true).await;
    let mut env = EnvironmentRecord::new("shared-box", EnvironmentState::Starting);
    env.kind = EnvironmentKind::Static;
    env.compute_resource_id = Some("vm-1".to_string());
    f.environments.create(&env).await.unwrap();

    // Static environments keep monitoring even if the compute id moved.
    let mut watch = StateTransitionInput::for_environment(&env, EnvironmentState::Available, TIMEOUT);
    watch.compute_resource_id = Some("vm-old".to_string());

    let result = check(&f, &watch).await;
    assert_eq!(result.status(), OperationState::Failed);
    assert_eq!(result.error_reason(), Some("TimeoutInStateTransition"));
    assert_eq!(state_of(&f, &env.id).await, EnvironmentState::Starting);
    assert!(f.queue.is_empty());
}

#[tokio::test]
async fn test_guards_cancel_monitoring() {
    let f = fixture(false).await;
    let env = environment(&f, EnvironmentState::Starting).await;
    let watch = StateTransitionInput::for_environment(&env, EnvironmentState::Available, TIMEOUT);
    let result = f.monitor.resume(&input(&watch)).await.unwrap();
    assert_eq!(result.error_reason(), Some("EnvironmentMonitoringDisabled"));

    let f = fixture(true).await;
    let env = environment(&f, EnvironmentState::Starting).await;
    let mut watch = StateTransitionInput::for_environment(&env, EnvironmentState::Available, TIMEOUT);
    watch.compute_resource_id = Some("vm-2".to_string());
    let result = f.monitor.resume(&input(&watch)).await.unwrap();
    assert_eq!(result.error_reason(), Some("EnvironmentResourceChanged"));

    watch.environment_id = "missing".to_string();
    let result = f.monitor.resume(&input(&watch)).await.unwrap();
    assert_eq!(result.status(), OperationState::Cancelled);
    assert_eq!(result.error_reason(), Some("EnvironmentRecordNotFound"));
}
