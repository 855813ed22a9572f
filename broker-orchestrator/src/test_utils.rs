use crate::handlers::ResourceLifecycleHandler;
use crate::operations::ResourceContinuationOperations;
use crate::pool::{ResourcePoolDefinition, StaticPoolDefinitionStore};
use crate::provider::{LifecycleRequest, LifecycleStage, ResourceProvider};
use crate::repository::{ResourceRepository, SqliteResourceRepository};
use crate::resource::{ResourceOperation, ResourceRecord, ResourceType};
use async_trait::async_trait;
use broker_continuation::{
    ContinuationActivator, ContinuationPayload, ContinuationQueue, HandlerRegistry,
    NextStageInput, ProviderStep,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Helper to create an in-memory test database with migrations applied
pub async fn create_test_db() -> SqlitePool {
    // Every connection to :memory: is its own database, so pin the pool to one.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// File-backed database for tests that need real concurrent connections.
pub async fn create_file_test_db(dir: &Path) -> SqlitePool {
    let options = SqliteConnectOptions::new()
        .filename(dir.join("broker-test.db"))
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .expect("Failed to create file database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// Pool definition used across tests: logical `Large` maps to `LargeVm`.
pub fn definition(resource_type: ResourceType, location: &str) -> ResourcePoolDefinition {
    let sku = match resource_type {
        ResourceType::ComputeVm => "LargeVm",
        ResourceType::OsDisk => "PremiumDisk",
        ResourceType::StorageFileShare => "PremiumShare",
        ResourceType::StorageArchive => "ColdArchive",
        ResourceType::KeyVault => "StandardVault",
        ResourceType::InputQueue => "StandardQueue",
    };
    ResourcePoolDefinition {
        resource_type,
        location: location.to_string(),
        sku_name: sku.to_string(),
        logical_skus: vec!["Large".to_string()],
        target_count: 5,
        dimensions: BTreeMap::new(),
        image_version: None,
    }
}

/// Inserts `count` ready, unassigned members of the pool and returns their ids.
pub async fn seed_pool(
    repository: &dyn ResourceRepository,
    definition: &ResourcePoolDefinition,
    count: usize,
) -> Vec<String> {
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        let record = ResourceRecord::new_pooled(definition).ready();
        repository
            .create(&record)
            .await
            .expect("Failed to seed resource");
        ids.push(record.id);
    }
    ids
}

/// Provider that finishes every operation after a fixed number of checks.
pub struct ScriptedProvider {
    checks_to_finish: u32,
    failing: HashSet<ResourceOperation>,
    begins: AtomicUsize,
    requests: Mutex<Vec<(ResourceOperation, LifecycleRequest)>>,
}

impl ScriptedProvider {
    pub fn new(checks_to_finish: u32) -> Self {
        Self {
            checks_to_finish,
            failing: HashSet::new(),
            begins: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Checks of `operation` report a provider failure.
    pub fn failing(mut self, operation: ResourceOperation) -> Self {
        self.failing.insert(operation);
        self
    }

    pub fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<(ResourceOperation, LifecycleRequest)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResourceProvider for ScriptedProvider {
    async fn begin(
        &self,
        operation: ResourceOperation,
        record: &ResourceRecord,
        request: &LifecycleRequest,
    ) -> broker_continuation::Result<ProviderStep<LifecycleStage>> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap()
            .push((operation, request.clone()));
        Ok(ProviderStep::in_progress(
            NextStageInput::new(LifecycleStage::Submitted, &record.id)
                .with_tracking_id(format!("{operation}-{}", record.id)),
        ))
    }

    async fn check(
        &self,
        operation: ResourceOperation,
        _record: &ResourceRecord,
        next: NextStageInput<LifecycleStage>,
    ) -> broker_continuation::Result<ProviderStep<LifecycleStage>> {
        if self.failing.contains(&operation) {
            return Ok(ProviderStep::failed(next, format!("{operation} rejected by provider")));
        }
        let polls = match next.stage {
            LifecycleStage::Checking { polls } => polls + 1,
            _ => 1,
        };
        let next = next.advance(LifecycleStage::Checking { polls });
        if polls >= self.checks_to_finish {
            Ok(ProviderStep::succeeded(next))
        } else {
            Ok(ProviderStep::in_progress(next))
        }
    }

    fn retry_after(&self, _operation: ResourceOperation) -> Duration {
        Duration::ZERO
    }
}

/// Queue that only records what was enqueued.
#[derive(Default)]
pub struct RecordingQueue {
    payloads: Mutex<Vec<(ContinuationPayload, Duration)>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.payloads.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn take(&self) -> Vec<(ContinuationPayload, Duration)> {
        std::mem::take(&mut *self.payloads.lock().unwrap())
    }
}

#[async_trait]
impl ContinuationQueue for RecordingQueue {
    async fn enqueue(
        &self,
        payload: ContinuationPayload,
        delay: Duration,
    ) -> broker_continuation::Result<()> {
        self.payloads.lock().unwrap().push((payload, delay));
        Ok(())
    }
}

/// Repository, pools, provider and activator wired over one test database.
pub struct Harness {
    pub db: SqlitePool,
    pub repository: Arc<dyn ResourceRepository>,
    pub pools: Arc<StaticPoolDefinitionStore>,
    pub provider: Arc<ScriptedProvider>,
    pub queue: Arc<RecordingQueue>,
    pub activator: Arc<ContinuationActivator>,
    pub continuations: Arc<ResourceContinuationOperations>,
}

impl Harness {
    pub async fn new(definitions: Vec<ResourcePoolDefinition>, provider: ScriptedProvider) -> Self {
        let db = create_test_db().await;
        let repository = SqliteResourceRepository::shared(db.clone());
        let pools = Arc::new(
            StaticPoolDefinitionStore::new(definitions).expect("Failed to load pool definitions"),
        );
        let provider = Arc::new(provider);
        let queue = Arc::new(RecordingQueue::new());

        let registry = ResourceLifecycleHandler::all(repository.clone(), provider.clone())
            .into_iter()
            .fold(HandlerRegistry::new(), |registry, handler| registry.register(handler));
        let activator = Arc::new(ContinuationActivator::new(registry, queue.clone()));
        let continuations = Arc::new(ResourceContinuationOperations::new(activator.clone()));

        Self {
            db,
            repository,
            pools,
            provider,
            queue,
            activator,
            continuations,
        }
    }

    /// Redelivers queued payloads until no lifeline has work left.
    pub async fn drain(&self) -> usize {
        let mut steps = 0;
        for _ in 0..100 {
            let batch = self.queue.take();
            if batch.is_empty() {
                return steps;
            }
            for (payload, _) in batch {
                self.activator.continue_payload(payload).await;
                steps += 1;
            }
        }
        panic!("Continuations did not settle");
    }

    pub async fn record(&self, id: &str) -> ResourceRecord {
        self.repository
            .get(id)
            .await
            .expect("Failed to read resource")
            .expect("Resource should exist")
    }
}
