//! Guardian registry collaborator
//!
//! The registry is the source of truth for who may sign for a federation,
//! their public key shares and the federation threshold.

use async_trait::async_trait;
use k256::AffinePoint;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;

use crate::crypto;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("federation not found: {0}")]
    FederationNotFound(String),
    #[error("invalid registry data: {0}")]
    InvalidData(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

/// A guardian as published by the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianInfo {
    pub guardian_id: String,
    /// Share index (x-coordinate of this guardian's share), 1-based
    pub share_index: u16,
    /// Public key share (hex-encoded compressed point)
    pub public_key_share: String,
}

/// Registry record of one federation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationRecord {
    pub federation_id: String,
    pub threshold: u16,
    /// Federation public key (hex-encoded compressed point)
    pub group_public_key: String,
    pub guardians: Vec<GuardianInfo>,
}

#[async_trait]
pub trait GuardianRegistry: Send + Sync {
    async fn get_guardians(&self, federation_id: &str) -> Result<Vec<GuardianInfo>, RegistryError>;

    async fn get_threshold(&self, federation_id: &str) -> Result<u16, RegistryError>;

    /// Federation public key (hex-encoded compressed point)
    async fn get_group_public_key(&self, federation_id: &str) -> Result<String, RegistryError>;
}

/// Registry backed by records loaded at startup
#[derive(Debug, Clone, Default)]
pub struct StaticGuardianRegistry {
    federations: HashMap<String, FederationRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(rename = "federation")]
    federations: Vec<FederationRecord>,
}

impl StaticGuardianRegistry {
    pub fn new(records: impl IntoIterator<Item = FederationRecord>) -> Self {
        Self {
            federations: records
                .into_iter()
                .map(|r| (r.federation_id.clone(), r))
                .collect(),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, RegistryError> {
        let file: RegistryFile =
            toml::from_str(content).map_err(|e| RegistryError::InvalidData(e.to_string()))?;
        Ok(Self::new(file.federations))
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let registry = Self::from_toml_str(&content)?;

        tracing::info!(
            path = %path.as_ref().display(),
            federations = registry.federations.len(),
            "Loaded guardian registry"
        );
        Ok(registry)
    }

    pub fn to_toml_string(&self) -> Result<String, RegistryError> {
        let mut federations: Vec<FederationRecord> = self.federations.values().cloned().collect();
        federations.sort_by(|a, b| a.federation_id.cmp(&b.federation_id));
        toml::to_string_pretty(&RegistryFile { federations })
            .map_err(|e| RegistryError::InvalidData(e.to_string()))
    }

    fn record(&self, federation_id: &str) -> Result<&FederationRecord, RegistryError> {
        self.federations
            .get(federation_id)
            .ok_or_else(|| RegistryError::FederationNotFound(federation_id.to_string()))
    }
}

#[async_trait]
impl GuardianRegistry for StaticGuardianRegistry {
    async fn get_guardians(&self, federation_id: &str) -> Result<Vec<GuardianInfo>, RegistryError> {
        Ok(self.record(federation_id)?.guardians.clone())
    }

    async fn get_threshold(&self, federation_id: &str) -> Result<u16, RegistryError> {
        Ok(self.record(federation_id)?.threshold)
    }

    async fn get_group_public_key(&self, federation_id: &str) -> Result<String, RegistryError> {
        Ok(self.record(federation_id)?.group_public_key.clone())
    }
}

/// A guardian's decoded public material
#[derive(Debug, Clone, Copy)]
pub struct GuardianKey {
    pub share_index: u16,
    pub public_share: AffinePoint,
}

/// Decoded, validated snapshot of a federation
#[derive(Debug, Clone)]
pub struct Federation {
    pub federation_id: String,
    pub threshold: u16,
    pub group_key: AffinePoint,
    pub guardians: BTreeMap<String, GuardianKey>,
}

impl Federation {
    /// Query the registry and decode every key
    pub async fn load(
        registry: &dyn GuardianRegistry,
        federation_id: &str,
    ) -> Result<Self, RegistryError> {
        let guardians = registry.get_guardians(federation_id).await?;
        let threshold = registry.get_threshold(federation_id).await?;
        let group_key_hex = registry.get_group_public_key(federation_id).await?;

        let group_key = crypto::parse_point(&group_key_hex)
            .map_err(|e| RegistryError::InvalidData(format!("group public key: {}", e)))?;

        let mut decoded = BTreeMap::new();
        let mut indices = std::collections::BTreeSet::new();
        for guardian in guardians {
            if guardian.share_index == 0 || !indices.insert(guardian.share_index) {
                return Err(RegistryError::InvalidData(format!(
                    "guardian {} has invalid share index {}",
                    guardian.guardian_id, guardian.share_index
                )));
            }
            let public_share = crypto::parse_point(&guardian.public_key_share).map_err(|e| {
                RegistryError::InvalidData(format!("key share of {}: {}", guardian.guardian_id, e))
            })?;
            let key = GuardianKey {
                share_index: guardian.share_index,
                public_share,
            };
            if decoded.insert(guardian.guardian_id.clone(), key).is_some() {
                return Err(RegistryError::InvalidData(format!(
                    "duplicate guardian {}",
                    guardian.guardian_id
                )));
            }
        }

        Ok(Self {
            federation_id: federation_id.to_string(),
            threshold,
            group_key,
            guardians: decoded,
        })
    }

    pub fn guardian(&self, guardian_id: &str) -> Option<&GuardianKey> {
        self.guardians.get(guardian_id)
    }

    pub fn guardian_ids(&self) -> Vec<String> {
        self.guardians.keys().cloned().collect()
    }
}
