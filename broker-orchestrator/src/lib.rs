//! Warm-pool resource broker
//!
//! Keeps pools of pre-created cloud resources, hands members out to one
//! environment at a time, drives their lifecycle through resumable
//! continuations and deletes members of pools that no longer exist. Used by
//! the `broker-worker` process but usable from any async entry point.

pub mod allocation;
pub mod broker;
pub mod db;
pub mod environment;
pub mod error;
pub mod handlers;
pub mod lease_store;
pub mod monitor;
pub mod operations;
pub mod pool;
pub mod provider;
pub mod reconciler;
pub mod repository;
pub mod resource;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use allocation::{AllocationStrategy, BasicStrategy, OsDiskStrategy, ResourceAllocator};
pub use broker::{
    ResourceBroker, SecretFilter, SecretManager, StartAction, StartRequest, StaticSecretManager,
};
pub use environment::{
    EnvironmentKind, EnvironmentRecord, EnvironmentRepository, EnvironmentState,
    SqliteEnvironmentRepository,
};
pub use error::{BrokerError, Result};
pub use handlers::{lifecycle_target, ResourceLifecycleHandler};
pub use lease_store::SqliteLeaseStore;
pub use monitor::{
    EnvironmentRepairActions, MonitorScheduler, QueueMonitorScheduler, RepairActions,
    StateTransitionInput, StateTransitionMonitor, MONITOR_TARGET,
};
pub use operations::{ResourceContinuationOperations, ResourceContinuations};
pub use pool::{PoolDefinitionStore, PoolReference, ResourcePoolDefinition, StaticPoolDefinitionStore};
pub use provider::{
    CompanionResource, LifecycleRequest, LifecycleStage, ResourceProvider, SecretValue,
    StartPayload,
};
pub use reconciler::{is_active_pool, OrphanPoolReconciler, ReconcileSummary};
pub use repository::{mutate_with_retry, ResourceRepository, SqliteResourceRepository};
pub use resource::{
    AllocateInput, AllocateResult, PhaseState, PhaseStatus, ResourceOperation, ResourceRecord,
    ResourceStatus, ResourceType,
};
