use crate::pool::{PoolReference, ResourcePoolDefinition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
pub enum ResourceType {
    ComputeVm,
    OsDisk,
    StorageFileShare,
    StorageArchive,
    KeyVault,
    InputQueue,
}

impl ResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ComputeVm => "ComputeVm",
            Self::OsDisk => "OsDisk",
            Self::StorageFileShare => "StorageFileShare",
            Self::StorageArchive => "StorageArchive",
            Self::KeyVault => "KeyVault",
            Self::InputQueue => "InputQueue",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle phases tracked independently on every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceOperation {
    Provisioning,
    Starting,
    Deleting,
    Cleanup,
}

impl ResourceOperation {
    pub const ALL: [ResourceOperation; 4] = [
        Self::Provisioning,
        Self::Starting,
        Self::Deleting,
        Self::Cleanup,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provisioning => "Provisioning",
            Self::Starting => "Starting",
            Self::Deleting => "Deleting",
            Self::Cleanup => "Cleanup",
        }
    }
}

impl fmt::Display for ResourceOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
pub enum PhaseStatus {
    Initialized,
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
}

/// Status of one lifecycle phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseState {
    pub status: Option<PhaseStatus>,
    pub changed: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl PhaseState {
    pub fn set(&mut self, status: PhaseStatus, reason: Option<String>) {
        self.status = Some(status);
        self.changed = Some(Utc::now());
        self.reason = reason;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: String,
    pub resource_type: ResourceType,
    pub sku_name: String,
    pub location: String,
    pub pool_reference: PoolReference,
    pub environment_id: Option<String>,
    /// Owning compute for companion records such as OS disks.
    pub component_of: Option<String>,
    pub is_ready: bool,
    pub is_assigned: bool,
    pub assigned: Option<DateTime<Utc>>,
    pub assigned_reason: Option<String>,
    pub is_deleted: bool,
    pub deleted: Option<DateTime<Utc>>,
    pub provisioning: PhaseState,
    pub starting: PhaseState,
    pub deleting: PhaseState,
    pub cleanup: PhaseState,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// Optimistic concurrency token, bumped on every write.
    pub version: i64,
}

impl ResourceRecord {
    /// A fresh, unassigned pool member for `definition`.
    pub fn new_pooled(definition: &ResourcePoolDefinition) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            resource_type: definition.resource_type,
            sku_name: definition.sku_name.clone(),
            location: definition.location.clone(),
            pool_reference: definition.reference(),
            environment_id: None,
            component_of: None,
            is_ready: false,
            is_assigned: false,
            assigned: None,
            assigned_reason: None,
            is_deleted: false,
            deleted: None,
            provisioning: PhaseState::default(),
            starting: PhaseState::default(),
            deleting: PhaseState::default(),
            cleanup: PhaseState::default(),
            created: now,
            updated: now,
            version: 0,
        }
    }

    pub fn ready(mut self) -> Self {
        self.is_ready = true;
        self
    }

    pub fn phase(&self, operation: ResourceOperation) -> &PhaseState {
        match operation {
            ResourceOperation::Provisioning => &self.provisioning,
            ResourceOperation::Starting => &self.starting,
            ResourceOperation::Deleting => &self.deleting,
            ResourceOperation::Cleanup => &self.cleanup,
        }
    }

    pub fn phase_mut(&mut self, operation: ResourceOperation) -> &mut PhaseState {
        match operation {
            ResourceOperation::Provisioning => &mut self.provisioning,
            ResourceOperation::Starting => &mut self.starting,
            ResourceOperation::Deleting => &mut self.deleting,
            ResourceOperation::Cleanup => &mut self.cleanup,
        }
    }

    pub fn mark_deleted(&mut self) {
        self.is_deleted = true;
        self.deleted = Some(Utc::now());
    }
}

/// One requested resource in an allocation batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateInput {
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    pub logical_sku: String,
    pub location: String,
    /// Extra pool dimensions the request must match.
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
}

impl AllocateInput {
    pub fn new(
        resource_type: ResourceType,
        logical_sku: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            resource_type,
            logical_sku: logical_sku.into(),
            location: location.into(),
            dimensions: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocateResult {
    pub resource_id: String,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    pub sku_name: String,
    pub location: String,
    pub is_ready: bool,
    pub created: DateTime<Utc>,
}

impl From<&ResourceRecord> for AllocateResult {
    fn from(record: &ResourceRecord) -> Self {
        Self {
            resource_id: record.id.clone(),
            resource_type: record.resource_type,
            sku_name: record.sku_name.clone(),
            location: record.location.clone(),
            is_ready: record.is_ready,
            created: record.created,
        }
    }
}

/// Per-resource view returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub resource_id: String,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    pub sku_name: String,
    pub location: String,
    pub is_ready: bool,
    pub is_assigned: bool,
    pub is_deleted: bool,
    pub created: DateTime<Utc>,
    pub provisioning: PhaseState,
    pub starting: PhaseState,
    pub deleting: PhaseState,
    pub cleanup: PhaseState,
}

impl From<ResourceRecord> for ResourceStatus {
    fn from(record: ResourceRecord) -> Self {
        Self {
            resource_id: record.id,
            resource_type: record.resource_type,
            sku_name: record.sku_name,
            location: record.location,
            is_ready: record.is_ready,
            is_assigned: record.is_assigned,
            is_deleted: record.is_deleted,
            created: record.created,
            provisioning: record.provisioning,
            starting: record.starting,
            deleting: record.deleting,
            cleanup: record.cleanup,
        }
    }
}
