//! Public entry point: allocate from pools and drive resources through their
//! lifecycle.

use crate::allocation::ResourceAllocator;
use crate::error::{BrokerError, Result};
use crate::operations::ResourceContinuations;
use crate::provider::{CompanionResource, LifecycleRequest, SecretValue, StartPayload};
use crate::repository::ResourceRepository;
use crate::resource::{AllocateInput, AllocateResult, ResourceRecord, ResourceStatus, ResourceType};
use async_trait::async_trait;
use broker_continuation::ContinuationResult;
use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument};

/// Selects secrets from a [`SecretManager`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretFilter {
    /// Only secrets in this scope. Unscoped secrets always apply.
    #[serde(default)]
    pub scope: Option<String>,
    /// Only these names. Empty means all.
    #[serde(default)]
    pub names: Vec<String>,
}

impl SecretFilter {
    pub fn accepts(&self, secret: &SecretValue) -> bool {
        let scope_ok = match (&secret.scope, &self.scope) {
            (None, _) => true,
            (Some(s), Some(wanted)) => s == wanted,
            (Some(_), None) => false,
        };
        scope_ok && (self.names.is_empty() || self.names.contains(&secret.name))
    }
}

#[async_trait]
pub trait SecretManager: Send + Sync {
    async fn applicable_secrets(&self, filter: &SecretFilter) -> Result<Vec<SecretValue>>;
}

/// Fixed set of secrets, for single-node deployments and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretManager {
    secrets: Vec<SecretValue>,
}

impl StaticSecretManager {
    pub fn new(secrets: Vec<SecretValue>) -> Self {
        Self { secrets }
    }
}

#[async_trait]
impl SecretManager for StaticSecretManager {
    async fn applicable_secrets(&self, filter: &SecretFilter) -> Result<Vec<SecretValue>> {
        Ok(self
            .secrets
            .iter()
            .filter(|s| filter.accepts(s))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartAction {
    /// Boot a compute with its disk, file share or archive.
    StartCompute,
    /// Restore a file share from its archive.
    StartArchive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub environment_id: String,
    pub action: StartAction,
    pub resource_ids: Vec<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Explicit secrets. When absent, `secret_filter` selects from the manager.
    #[serde(default)]
    pub secrets: Option<Vec<SecretValue>>,
    #[serde(default)]
    pub secret_filter: Option<SecretFilter>,
    pub reason: String,
}

pub struct ResourceBroker {
    allocator: ResourceAllocator,
    repository: Arc<dyn ResourceRepository>,
    continuations: Arc<dyn ResourceContinuations>,
    secrets: Arc<dyn SecretManager>,
}

impl ResourceBroker {
    pub fn new(
        allocator: ResourceAllocator,
        repository: Arc<dyn ResourceRepository>,
        continuations: Arc<dyn ResourceContinuations>,
        secrets: Arc<dyn SecretManager>,
    ) -> Self {
        Self {
            allocator,
            repository,
            continuations,
            secrets,
        }
    }

    pub async fn allocate(
        &self,
        environment_id: &str,
        inputs: &[AllocateInput],
        reason: &str,
    ) -> Result<Vec<AllocateResult>> {
        self.allocator.allocate(environment_id, inputs, reason).await
    }

    #[instrument(skip(self, request), fields(environment_id = %request.environment_id, action = ?request.action))]
    pub async fn start(&self, request: StartRequest) -> Result<ContinuationResult> {
        check_start_cardinality(request.action, request.resource_ids.len())?;

        let mut records = Vec::with_capacity(request.resource_ids.len());
        for id in &request.resource_ids {
            let record = self
                .repository
                .get(id)
                .await?
                .filter(|r| !r.is_deleted)
                .ok_or_else(|| BrokerError::NotFound(id.clone()))?;
            records.push(record);
        }

        let (primary, companions) = match request.action {
            StartAction::StartCompute => split_compute(&records)?,
            StartAction::StartArchive => split_archive(&records)?,
        };

        let secrets = match (request.secrets, &request.secret_filter) {
            (Some(secrets), _) => secrets,
            (None, Some(filter)) => self.secrets.applicable_secrets(filter).await?,
            (None, None) => Vec::new(),
        };

        info!(
            primary = %primary.id,
            companions = companions.len(),
            secrets = secrets.len(),
            "Starting resources"
        );

        let lifecycle = LifecycleRequest {
            resource_id: primary.id.clone(),
            reason: request.reason,
            environment_id: Some(request.environment_id),
            start: Some(StartPayload {
                companions: companions
                    .iter()
                    .map(|r| CompanionResource {
                        resource_id: r.id.clone(),
                        resource_type: r.resource_type,
                    })
                    .collect(),
                variables: request.variables,
                secrets,
            }),
        };

        self.continuations.start(lifecycle).await
    }

    pub async fn suspend(
        &self,
        environment_id: &str,
        resource_ids: &[String],
        reason: &str,
    ) -> Result<Vec<ContinuationResult>> {
        try_join_all(
            resource_ids
                .iter()
                .map(|id| self.continuations.suspend(id, Some(environment_id), reason)),
        )
        .await
    }

    pub async fn delete(&self, resource_ids: &[String], reason: &str) -> Result<Vec<ContinuationResult>> {
        try_join_all(
            resource_ids
                .iter()
                .map(|id| self.continuations.delete(id, reason)),
        )
        .await
    }

    /// Status per id, `None` for unknown ids.
    pub async fn status(&self, resource_ids: &[String]) -> Result<Vec<Option<ResourceStatus>>> {
        let records = try_join_all(resource_ids.iter().map(|id| self.repository.get(id))).await?;
        Ok(records
            .into_iter()
            .map(|r| r.map(ResourceStatus::from))
            .collect())
    }
}

fn check_start_cardinality(action: StartAction, count: usize) -> Result<()> {
    let supported = match action {
        StartAction::StartCompute => (2..=3).contains(&count),
        StartAction::StartArchive => count == 2,
    };
    if supported {
        Ok(())
    } else {
        Err(BrokerError::NotSupported(format!(
            "{action:?} does not take {count} resources"
        )))
    }
}

/// One compute plus at most one each of disk, share and archive.
fn split_compute(records: &[ResourceRecord]) -> Result<(&ResourceRecord, Vec<&ResourceRecord>)> {
    const COMPANIONS: [ResourceType; 3] = [
        ResourceType::OsDisk,
        ResourceType::StorageFileShare,
        ResourceType::StorageArchive,
    ];

    let mut compute = None;
    let mut companions: Vec<&ResourceRecord> = Vec::new();
    for record in records {
        match record.resource_type {
            ResourceType::ComputeVm if compute.is_none() => compute = Some(record),
            t if COMPANIONS.contains(&t)
                && !companions.iter().any(|c| c.resource_type == t) =>
            {
                companions.push(record)
            }
            t => {
                return Err(BrokerError::NotSupported(format!(
                    "StartCompute cannot take {t} resource {}",
                    record.id
                )))
            }
        }
    }

    let compute = compute.ok_or_else(|| {
        BrokerError::NotSupported("StartCompute needs a compute resource".to_string())
    })?;
    Ok((compute, companions))
}

/// The file share is started from its archive.
fn split_archive(records: &[ResourceRecord]) -> Result<(&ResourceRecord, Vec<&ResourceRecord>)> {
    let find = |t: ResourceType| records.iter().find(|r| r.resource_type == t);
    match (find(ResourceType::StorageFileShare), find(ResourceType::StorageArchive)) {
        (Some(share), Some(archive)) => Ok((share, vec![archive])),
        _ => Err(BrokerError::NotSupported(
            "StartArchive needs one file share and one archive".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(name: &str, scope: Option<&str>) -> SecretValue {
        SecretValue {
            name: name.to_string(),
            value: "v".to_string(),
            scope: scope.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_static_secrets_filter_by_scope_and_name() {
        let manager = StaticSecretManager::new(vec![
            secret("TOKEN", None),
            secret("DB_PASSWORD", Some("team-a")),
            secret("API_KEY", Some("team-b")),
        ]);

        let filter = SecretFilter {
            scope: Some("team-a".to_string()),
            names: vec![],
        };
        let names: Vec<_> = manager
            .applicable_secrets(&filter)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["TOKEN", "DB_PASSWORD"]);

        let filter = SecretFilter {
            scope: None,
            names: vec!["API_KEY".to_string(), "TOKEN".to_string()],
        };
        let names: Vec<_> = manager
            .applicable_secrets(&filter)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["TOKEN"]);
    }

    #[test]
    fn test_start_cardinality() {
        assert!(check_start_cardinality(StartAction::StartCompute, 1).is_err());
        assert!(check_start_cardinality(StartAction::StartCompute, 2).is_ok());
        assert!(check_start_cardinality(StartAction::StartCompute, 3).is_ok());
        assert!(check_start_cardinality(StartAction::StartCompute, 4).is_err());
        assert!(check_start_cardinality(StartAction::StartArchive, 1).is_err());
        assert!(check_start_cardinality(StartAction::StartArchive, 2).is_ok());
    }
}
