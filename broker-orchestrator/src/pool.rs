//! Pool definitions and their deterministic codes.

use crate::error::{BrokerError, Result};
use crate::resource::{AllocateInput, ResourceType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::RwLock;
use tracing::info;

/// Shape of one warm pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePoolDefinition {
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    pub location: String,
    /// Physical SKU.
    pub sku_name: String,
    /// Caller-facing names that resolve to this pool.
    #[serde(default)]
    pub logical_skus: Vec<String>,
    #[serde(default)]
    pub target_count: u32,
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
    #[serde(default)]
    pub image_version: Option<String>,
}

impl ResourcePoolDefinition {
    fn shape(&self) -> String {
        let dimensions = self
            .dimensions
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(";");
        format!(
            "{}|{}|{}|{}",
            self.resource_type.as_str(),
            self.location.to_ascii_lowercase(),
            self.sku_name,
            dimensions
        )
    }

    /// Deterministic identity from type, location, SKU and dimensions.
    pub fn code(&self) -> String {
        sha1_hex(&self.shape())
    }

    /// Changes whenever the image version changes, even if the code does not.
    pub fn version_code(&self) -> String {
        let image = self.image_version.as_deref().unwrap_or_default();
        sha1_hex(&format!("{}|{}", self.code(), image))
    }

    pub fn reference(&self) -> PoolReference {
        PoolReference {
            code: self.code(),
            version_code: self.version_code(),
            dimensions: self.dimensions.clone(),
        }
    }

    /// Whether an allocation request resolves to this pool.
    pub fn matches(&self, input: &AllocateInput) -> bool {
        self.resource_type == input.resource_type
            && self.location.eq_ignore_ascii_case(&input.location)
            && self.logical_skus.iter().any(|s| s == &input.logical_sku)
            && input
                .dimensions
                .iter()
                .all(|(k, v)| self.dimensions.get(k) == Some(v))
    }
}

fn sha1_hex(input: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Pool identity stored on every pooled record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolReference {
    pub code: String,
    pub version_code: String,
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
}

/// Source of the currently active pool definitions.
#[async_trait]
pub trait PoolDefinitionStore: Send + Sync {
    async fn retrieve_definitions(&self) -> Result<Vec<ResourcePoolDefinition>>;

    /// Resolves a logical SKU request to the single pool serving it.
    async fn map_logical_sku(&self, input: &AllocateInput) -> Result<Option<ResourcePoolDefinition>> {
        let definitions = self.retrieve_definitions().await?;
        Ok(definitions.into_iter().find(|d| d.matches(input)))
    }
}

#[derive(Debug, Deserialize)]
struct PoolFile {
    #[serde(default)]
    pools: Vec<ResourcePoolDefinition>,
}

/// Definitions held in memory, typically loaded from a YAML file.
///
/// ```yaml
/// pools:
///   - type: ComputeVm
///     location: WestUs2
///     sku_name: LargeVm
///     logical_skus: [Large]
///     target_count: 10
/// ```
pub struct StaticPoolDefinitionStore {
    definitions: RwLock<Vec<ResourcePoolDefinition>>,
}

impl StaticPoolDefinitionStore {
    pub fn new(definitions: Vec<ResourcePoolDefinition>) -> Result<Self> {
        validate(&definitions)?;
        Ok(Self {
            definitions: RwLock::new(definitions),
        })
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let file: PoolFile = serde_yaml_ng::from_str(yaml)?;
        Self::new(file.pools)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let store = Self::from_yaml_str(&contents)?;
        info!(path = %path.display(), pools = store.len(), "Loaded pool definitions");
        Ok(store)
    }

    /// Swaps in a new set of definitions; pools that disappear become orphaned.
    pub fn replace(&self, definitions: Vec<ResourcePoolDefinition>) -> Result<()> {
        validate(&definitions)?;
        *self.definitions.write().unwrap_or_else(|p| p.into_inner()) = definitions;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<ResourcePoolDefinition> {
        self.definitions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl PoolDefinitionStore for StaticPoolDefinitionStore {
    async fn retrieve_definitions(&self) -> Result<Vec<ResourcePoolDefinition>> {
        Ok(self.snapshot())
    }
}

fn validate(definitions: &[ResourcePoolDefinition]) -> Result<()> {
    let mut aliases = HashSet::new();
    for definition in definitions {
        if definition.sku_name.trim().is_empty() || definition.location.trim().is_empty() {
            return Err(BrokerError::Configuration(format!(
                "pool {} is missing a sku or location",
                definition.code()
            )));
        }
        for logical in &definition.logical_skus {
            let key = (
                definition.resource_type,
                definition.location.to_ascii_lowercase(),
                logical.clone(),
                definition.dimensions.clone(),
            );
            if !aliases.insert(key) {
                return Err(BrokerError::Configuration(format!(
                    "logical sku '{}' for {} in {} maps to more than one pool",
                    logical, definition.resource_type, definition.location
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn large_vm() -> ResourcePoolDefinition {
        ResourcePoolDefinition {
            resource_type: ResourceType::ComputeVm,
            location: "WestUs2".to_string(),
            sku_name: "LargeVm".to_string(),
            logical_skus: vec!["Large".to_string()],
            target_count: 5,
            dimensions: BTreeMap::from([("os".to_string(), "linux".to_string())]),
            image_version: Some("1.0.0".to_string()),
        }
    }

    #[test]
    fn test_code_is_deterministic_and_shape_based() {
        let a = large_vm();
        let mut b = large_vm();
        b.target_count = 50;
        b.logical_skus.push("Big".to_string());
        assert_eq!(a.code(), b.code());
        assert_eq!(a.code().len(), 40);

        let mut moved = large_vm();
        moved.location = "EastUs".to_string();
        assert_ne!(a.code(), moved.code());

        let mut other_os = large_vm();
        other_os.dimensions.insert("os".to_string(), "windows".to_string());
        assert_ne!(a.code(), other_os.code());
    }

    #[test]
    fn test_version_code_tracks_image() {
        let a = large_vm();
        let mut b = large_vm();
        b.image_version = Some("1.0.1".to_string());
        assert_eq!(a.code(), b.code());
        assert_ne!(a.version_code(), b.version_code());
    }

    #[test]
    fn test_matches_logical_sku_and_location() {
        let def = large_vm();
        assert!(def.matches(&AllocateInput::new(ResourceType::ComputeVm, "Large", "westus2")));
        assert!(!def.matches(&AllocateInput::new(ResourceType::ComputeVm, "LargeVm", "WestUs2")));
        assert!(!def.matches(&AllocateInput::new(ResourceType::KeyVault, "Large", "WestUs2")));
    }

    #[test]
    fn test_yaml_loading() {
        let yaml = r#"
pools:
  - type: ComputeVm
    location: WestUs2
    sku_name: LargeVm
    logical_skus: [Large]
    target_count: 10
  - type: StorageFileShare
    location: WestUs2
    sku_name: PremiumShare
    logical_skus: [Large]
"#;
        let store = StaticPoolDefinitionStore::from_yaml_str(yaml).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_duplicate_alias_rejected() {
        let mut twin = large_vm();
        twin.sku_name = "LargeVmV2".to_string();
        let result = StaticPoolDefinitionStore::new(vec![large_vm(), twin]);
        assert!(matches!(result, Err(BrokerError::Configuration(_))));
    }
}
