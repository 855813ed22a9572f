//! Integration tests for resource lifecycle continuations and the broker
//! facade over them.

use broker_continuation::OperationState;
use broker_orchestrator::test_utils::{definition, seed_pool, Harness, ScriptedProvider};
use broker_orchestrator::{
    BrokerError, PhaseStatus, ResourceAllocator, ResourceBroker, ResourceContinuations,
    ResourceOperation, ResourceRecord, ResourceType, SecretFilter, SecretValue,
    StartAction, StartRequest, StaticSecretManager,
};
use std::collections::BTreeMap;
use std::sync::Arc;

const LOCATION: &str = "WestUs2";

async fn harness(provider: ScriptedProvider) -> Harness {
    Harness::new(
        vec![
            definition(ResourceType::ComputeVm, LOCATION),
            definition(ResourceType::OsDisk, LOCATION),
            definition(ResourceType::StorageFileShare, LOCATION),
            definition(ResourceType::StorageArchive, LOCATION),
            definition(ResourceType::KeyVault, LOCATION),
        ],
        provider,
    )
    .await
}

fn broker(h: &Harness) -> ResourceBroker {
    let secrets = StaticSecretManager::new(vec![
        SecretValue {
            name: "REGISTRY_TOKEN".to_string(),
            value: "t0k3n".to_string(),
            scope: None,
        },
        SecretValue {
            name: "DB_PASSWORD".to_string(),
            value: "hunter2".to_string(),
            scope: Some("team-a".to_string()),
        },
    ]);
    ResourceBroker::new(
        ResourceAllocator::standard(h.repository.clone(), h.pools.clone()),
        h.repository.clone(),
        h.continuations.clone(),
        Arc::new(secrets),
    )
}

/// Seeds one resource of `resource_type` and assigns it to `environment_id`.
async fn assigned(h: &Harness, resource_type: ResourceType, environment_id: &str) -> String {
    let code = definition(resource_type, LOCATION).code();
    seed_pool(h.repository.as_ref(), &definition(resource_type, LOCATION), 1).await;
    h.repository
        .try_get(&code, environment_id, "UserRequest")
        .await
        .expect("Failed to claim resource")
        .expect("Seeded resource should be claimable")
        .id
}

fn start(environment_id: &str, action: StartAction, ids: Vec<String>) -> StartRequest {
    StartRequest {
        environment_id: environment_id.to_string(),
        action,
        resource_ids: ids,
        variables: BTreeMap::new(),
        secrets: None,
        secret_filter: None,
        reason: "UserStart".to_string(),
    }
}

#[tokio::test]
async fn test_provision_drives_record_to_ready() {
    let h = harness(ScriptedProvider::new(2)).await;
    let record = ResourceRecord::new_pooled(&definition(ResourceType::ComputeVm, LOCATION));
    h.repository.create(&record).await.expect("Failed to create record");

    let first = h
        .continuations
        .provision(&record.id, "PoolReplenish")
        .await
        .expect("Failed to start provisioning");
    assert_eq!(first.status(), OperationState::InProgress);
    assert_eq!(
        h.record(&record.id).await.provisioning.status,
        Some(PhaseStatus::InProgress)
    );

    let steps = h.drain().await;
    assert_eq!(steps, 2);

    let stored = h.record(&record.id).await;
    assert!(stored.is_ready);
    assert_eq!(stored.provisioning.status, Some(PhaseStatus::Succeeded));
    assert_eq!(stored.provisioning.reason.as_deref(), Some("PoolReplenish"));
    assert!(stored.provisioning.changed.is_some());
    assert_eq!(h.provider.begins(), 1);
}

#[tokio::test]
async fn test_delete_soft_deletes_record() {
    let h = harness(ScriptedProvider::new(1)).await;
    let id = assigned(&h, ResourceType::KeyVault, "env-1").await;
    let broker = broker(&h);

    let results = broker
        .delete(std::slice::from_ref(&id), "UserDelete")
        .await
        .expect("Failed to delete");
    assert_eq!(results.len(), 1);
    h.drain().await;

    let stored = h.record(&id).await;
    assert!(stored.is_deleted);
    assert!(stored.deleted.is_some());
    assert_eq!(stored.deleting.status, Some(PhaseStatus::Succeeded));

    // Redelivery after deletion finds nothing to act on.
    let again = h
        .continuations
        .delete(&id, "UserDelete")
        .await
        .expect("Delete of deleted record should not error");
    assert_eq!(again.status(), OperationState::Cancelled);
    assert_eq!(again.error_reason(), Some("ResourceRecordNotFound"));
}

#[tokio::test]
async fn test_provider_failure_marks_phase_failed() {
    let h = harness(ScriptedProvider::new(1).failing(ResourceOperation::Deleting)).await;
    let id = assigned(&h, ResourceType::ComputeVm, "env-1").await;

    h.continuations
        .delete(&id, "UserDelete")
        .await
        .expect("Failed to start delete");
    h.drain().await;

    let stored = h.record(&id).await;
    assert!(!stored.is_deleted);
    assert_eq!(stored.deleting.status, Some(PhaseStatus::Failed));
    assert_eq!(
        stored.deleting.reason.as_deref(),
        Some("Deleting rejected by provider")
    );
}

#[tokio::test]
async fn test_missing_record_cancels() {
    let h = harness(ScriptedProvider::new(1)).await;

    let result = h
        .continuations
        .delete("no-such-resource", "UserDelete")
        .await
        .expect("Missing record should not error");
    assert_eq!(result.status(), OperationState::Cancelled);
    assert_eq!(result.error_reason(), Some("ResourceRecordNotFound"));
    assert!(h.queue.is_empty());
}

#[tokio::test]
async fn test_suspend_of_reassigned_resource_cancels() {
    let h = harness(ScriptedProvider::new(1)).await;
    let id = assigned(&h, ResourceType::ComputeVm, "env-1").await;
    let broker = broker(&h);

    let results = broker
        .suspend("env-2", std::slice::from_ref(&id), "UserSuspend")
        .await
        .expect("Suspend should not error");
    assert_eq!(results[0].status(), OperationState::Cancelled);
    assert_eq!(results[0].error_reason(), Some("ResourceReassigned"));
    assert_eq!(h.provider.begins(), 0);

    let results = broker
        .suspend("env-1", std::slice::from_ref(&id), "UserSuspend")
        .await
        .expect("Failed to suspend");
    assert_eq!(results[0].status(), OperationState::InProgress);
    h.drain().await;
    assert_eq!(h.record(&id).await.cleanup.status, Some(PhaseStatus::Succeeded));
}

#[tokio::test]
async fn test_start_compute_wrong_cardinality() {
    let h = harness(ScriptedProvider::new(1)).await;
    let broker = broker(&h);
    let compute = assigned(&h, ResourceType::ComputeVm, "env-1").await;
    let disk = assigned(&h, ResourceType::OsDisk, "env-1").await;
    let share = assigned(&h, ResourceType::StorageFileShare, "env-1").await;
    let archive = assigned(&h, ResourceType::StorageArchive, "env-1").await;
    let vault = assigned(&h, ResourceType::KeyVault, "env-1").await;

    for ids in [
        vec![compute.clone()],
        vec![
            compute.clone(),
            disk.clone(),
            share.clone(),
            archive.clone(),
        ],
        vec![compute.clone(), vault.clone()],
        vec![disk.clone(), share.clone()],
    ] {
        match broker
            .start(start("env-1", StartAction::StartCompute, ids.clone()))
            .await
        {
            Err(BrokerError::NotSupported(_)) => {}
            other => panic!("Expected NotSupported for {:?}, got {:?}", ids, other),
        }
    }
    assert_eq!(h.provider.begins(), 0);
}

#[tokio::test]
async fn test_start_compute_passes_companions_and_secrets() {
    let h = harness(ScriptedProvider::new(1)).await;
    let broker = broker(&h);
    let compute = assigned(&h, ResourceType::ComputeVm, "env-1").await;
    let share = assigned(&h, ResourceType::StorageFileShare, "env-1").await;

    let mut request = start(
        "env-1",
        StartAction::StartCompute,
        vec![share.clone(), compute.clone()],
    );
    request
        .variables
        .insert("REPO".to_string(), "github.com/example/app".to_string());
    request.secret_filter = Some(SecretFilter {
        scope: Some("team-a".to_string()),
        names: vec![],
    });

    let result = broker.start(request).await.expect("Failed to start");
    assert_eq!(result.status(), OperationState::InProgress);
    h.drain().await;
    assert_eq!(
        h.record(&compute).await.starting.status,
        Some(PhaseStatus::Succeeded)
    );

    let requests = h.provider.requests();
    assert_eq!(requests.len(), 1);
    let (operation, lifecycle) = &requests[0];
    assert_eq!(*operation, ResourceOperation::Starting);
    assert_eq!(lifecycle.resource_id, compute);
    assert_eq!(lifecycle.environment_id.as_deref(), Some("env-1"));

    let payload = lifecycle.start.as_ref().expect("Start payload should be set");
    assert_eq!(payload.companions.len(), 1);
    assert_eq!(payload.companions[0].resource_id, share);
    assert_eq!(payload.companions[0].resource_type, ResourceType::StorageFileShare);
    assert_eq!(payload.variables.get("REPO").map(String::as_str), Some("github.com/example/app"));
    let names: Vec<_> = payload.secrets.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["REGISTRY_TOKEN", "DB_PASSWORD"]);
}

#[tokio::test]
async fn test_start_archive_needs_share_and_archive() {
    let h = harness(ScriptedProvider::new(1)).await;
    let broker = broker(&h);
    let compute = assigned(&h, ResourceType::ComputeVm, "env-1").await;
    let share = assigned(&h, ResourceType::StorageFileShare, "env-1").await;
    let archive = assigned(&h, ResourceType::StorageArchive, "env-1").await;

    assert!(matches!(
        broker
            .start(start("env-1", StartAction::StartArchive, vec![compute, share.clone()]))
            .await,
        Err(BrokerError::NotSupported(_))
    ));

    let result = broker
        .start(start("env-1", StartAction::StartArchive, vec![archive.clone(), share.clone()]))
        .await
        .expect("Failed to start archive");
    assert_eq!(result.status(), OperationState::InProgress);

    let requests = h.provider.requests();
    let (_, lifecycle) = &requests[0];
    assert_eq!(lifecycle.resource_id, share);
    let companions = &lifecycle.start.as_ref().unwrap().companions;
    assert_eq!(companions[0].resource_id, archive);
}

#[tokio::test]
async fn test_start_unknown_resource_is_not_found() {
    let h = harness(ScriptedProvider::new(1)).await;
    let broker = broker(&h);
    let compute = assigned(&h, ResourceType::ComputeVm, "env-1").await;

    match broker
        .start(start(
            "env-1",
            StartAction::StartCompute,
            vec![compute, "missing".to_string()],
        ))
        .await
    {
        Err(BrokerError::NotFound(id)) => assert_eq!(id, "missing"),
        other => panic!("Expected NotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn test_status_reports_phases_and_missing_ids() {
    let h = harness(ScriptedProvider::new(1)).await;
    let broker = broker(&h);
    let id = assigned(&h, ResourceType::KeyVault, "env-1").await;
    broker
        .suspend("env-1", std::slice::from_ref(&id), "UserSuspend")
        .await
        .expect("Failed to suspend");
    h.drain().await;

    let statuses = broker
        .status(&[id.clone(), "missing".to_string()])
        .await
        .expect("Failed to read status");
    assert_eq!(statuses.len(), 2);
    let status = statuses[0].as_ref().expect("Status should be present");
    assert_eq!(status.resource_id, id);
    assert_eq!(status.resource_type, ResourceType::KeyVault);
    assert_eq!(status.sku_name, "StandardVault");
    assert!(status.is_assigned);
    assert_eq!(status.cleanup.status, Some(PhaseStatus::Succeeded));
    assert_eq!(status.provisioning.status, None);
    assert!(statuses[1].is_none());
}
