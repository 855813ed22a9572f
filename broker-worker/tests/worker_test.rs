//! Integration tests for the worker wiring over a file-backed database.

use broker_continuation::{run_worker, ContinuationPayload, MemoryQueue};
use broker_orchestrator::db::{create_pool, run_migrations};
use broker_orchestrator::test_utils::{definition, seed_pool};
use broker_orchestrator::{
    AllocateInput, PoolDefinitionStore, ResourcePoolDefinition, ResourceType,
    StaticPoolDefinitionStore,
};
use broker_worker::{
    commands, load_pool_definitions, BrokerService, Config, SimulatedProvider,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

const LOCATION: &str = "WestUs2";

fn retired() -> ResourcePoolDefinition {
    let mut old = definition(ResourceType::ComputeVm, LOCATION);
    old.sku_name = "OldVm".to_string();
    old.logical_skus = vec!["LegacyLarge".to_string()];
    old
}

fn config(dir: &Path) -> Config {
    let mut config = Config::from_lookup(|_| None);
    config.db_path = dir.join("broker.db");
    config
}

async fn service(
    dir: &Path,
    definitions: Vec<ResourcePoolDefinition>,
) -> (BrokerService, UnboundedReceiver<ContinuationPayload>) {
    let config = config(dir);
    let db = create_pool(&config.db_path)
        .await
        .expect("Failed to create database");
    run_migrations(&db).await.expect("Failed to run migrations");

    let pools = Arc::new(
        StaticPoolDefinitionStore::new(definitions).expect("Failed to load pool definitions"),
    );
    let (queue, receiver) = MemoryQueue::new();
    let service = BrokerService::new(
        &config,
        db,
        pools,
        Arc::new(SimulatedProvider::new(1, Duration::ZERO)),
        Arc::new(queue),
    );
    (service, receiver)
}

async fn wait_until_deleted(service: &BrokerService, id: &str) {
    for _ in 0..200 {
        let record = service
            .repository
            .get(id)
            .await
            .expect("Failed to read resource")
            .expect("Resource should exist");
        if record.is_deleted {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Resource {} was never deleted", id);
}

#[tokio::test]
async fn test_allocate_and_delete_through_workers() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let (service, receiver) =
        service(dir.path(), vec![definition(ResourceType::ComputeVm, LOCATION)]).await;
    seed_pool(
        service.repository.as_ref(),
        &definition(ResourceType::ComputeVm, LOCATION),
        2,
    )
    .await;

    let workers = tokio::spawn(run_worker(
        service.activator.clone(),
        receiver,
        4,
    ));

    let claimed = service
        .broker
        .allocate(
            "env-1",
            &[AllocateInput::new(ResourceType::ComputeVm, "Large", LOCATION)],
            "UserRequest",
        )
        .await
        .expect("Failed to allocate");
    assert_eq!(claimed.len(), 1);
    let id = claimed[0].resource_id.clone();

    service
        .broker
        .delete(&[id.clone()], "UserDelete")
        .await
        .expect("Failed to delete");
    wait_until_deleted(&service, &id).await;

    let code = definition(ResourceType::ComputeVm, LOCATION).code();
    assert_eq!(service.repository.count_unassigned(&code).await.unwrap(), 1);

    workers.abort();
}

#[tokio::test]
async fn test_reconcile_once_deletes_orphans() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let (service, receiver) =
        service(dir.path(), vec![definition(ResourceType::ComputeVm, LOCATION)]).await;
    let active = seed_pool(
        service.repository.as_ref(),
        &definition(ResourceType::ComputeVm, LOCATION),
        2,
    )
    .await;
    let orphans = seed_pool(service.repository.as_ref(), &retired(), 2).await;

    let summary = commands::reconcile_once(&service, receiver, Duration::from_millis(200))
        .await
        .expect("Failed to reconcile");
    assert_eq!(summary.orphaned_pools, 1);
    assert_eq!(summary.deleted.len(), 2);

    for id in &orphans {
        let record = service.repository.get(id).await.unwrap().unwrap();
        assert!(record.is_deleted, "orphan {} should be deleted", id);
    }
    for id in &active {
        let record = service.repository.get(id).await.unwrap().unwrap();
        assert!(!record.is_deleted);
    }

    commands::pools(&service).await.expect("Failed to list pools");
}

#[tokio::test]
async fn test_pool_definitions_from_yaml_file() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path: PathBuf = dir.path().join("pools.yaml");
    std::fs::write(
        &path,
        r#"
pools:
  - type: ComputeVm
    location: WestUs2
    sku_name: LargeVm
    logical_skus: [Large]
    target_count: 10
  - type: OsDisk
    location: WestUs2
    sku_name: PremiumDisk
    logical_skus: [Large]
"#,
    )
    .expect("Failed to write pool file");

    let mut config = config(dir.path());
    config.pool_definitions = Some(path);
    let store = load_pool_definitions(&config).expect("Failed to load pools");
    assert_eq!(store.len(), 2);
    let definitions = store.retrieve_definitions().await.unwrap();
    assert_eq!(definitions[0].target_count, 10);

    config.pool_definitions = None;
    assert!(load_pool_definitions(&config).unwrap().is_empty());

    config.pool_definitions = Some(dir.path().join("missing.yaml"));
    assert!(load_pool_definitions(&config).is_err());
}
