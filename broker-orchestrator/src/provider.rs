//! Seam to the cloud provider that actually creates and mutates resources.

use crate::resource::{ResourceOperation, ResourceRecord, ResourceType};
use async_trait::async_trait;
use broker_continuation::{NextStageInput, ProviderStep, Result as StepResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Stages of a lifecycle operation as carried in its continuation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum LifecycleStage {
    /// The provider accepted the request.
    Submitted,
    /// A named preparation step is running, e.g. attaching a file share.
    Preparing { step: String },
    /// Polling for completion.
    Checking { polls: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretValue {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanionResource {
    pub resource_id: String,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
}

/// Extra data for start operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartPayload {
    #[serde(default)]
    pub companions: Vec<CompanionResource>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub secrets: Vec<SecretValue>,
}

/// Body of every lifecycle continuation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleRequest {
    pub resource_id: String,
    pub reason: String,
    /// When set, the record must still belong to this environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<StartPayload>,
}

impl LifecycleRequest {
    pub fn new(resource_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            reason: reason.into(),
            environment_id: None,
            start: None,
        }
    }

    pub fn for_environment(mut self, environment_id: impl Into<String>) -> Self {
        self.environment_id = Some(environment_id.into());
        self
    }
}

/// Begin/check callbacks for each lifecycle operation.
///
/// `begin` may be called more than once for the same resource if a worker
/// dies before the first token is persisted, so implementations must check
/// for an existing request before submitting a new one.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn begin(
        &self,
        operation: ResourceOperation,
        record: &ResourceRecord,
        request: &LifecycleRequest,
    ) -> StepResult<ProviderStep<LifecycleStage>>;

    async fn check(
        &self,
        operation: ResourceOperation,
        record: &ResourceRecord,
        next: NextStageInput<LifecycleStage>,
    ) -> StepResult<ProviderStep<LifecycleStage>>;

    fn retry_after(&self, _operation: ResourceOperation) -> Duration {
        broker_continuation::DEFAULT_RETRY_AFTER
    }
}
