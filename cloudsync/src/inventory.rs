//! Providers and regions known to the engine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Provider, Region, ResourceKind};

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("unknown region: {0}")]
    UnknownRegion(String),
}

/// One provider entry of an inventory file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    #[serde(flatten)]
    pub provider: Provider,
    #[serde(default)]
    pub regions: Vec<Region>,
    /// Kinds to sync. Empty means every kind the driver serves.
    #[serde(default)]
    pub kinds: Vec<ResourceKind>,
}

/// On-disk inventory: providers, their regions, and where the upstream
/// snapshot lives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InventoryFile {
    #[serde(default)]
    pub snapshot: Option<PathBuf>,
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
}

impl InventoryFile {
    pub fn load(path: &Path) -> Result<Self, InventoryError> {
        let raw = std::fs::read(path).map_err(|source| InventoryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut file: InventoryFile =
            serde_json::from_slice(&raw).map_err(|source| InventoryError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        // Snapshot paths are relative to the inventory file.
        if let (Some(snapshot), Some(dir)) = (&file.snapshot, path.parent()) {
            if snapshot.is_relative() {
                file.snapshot = Some(dir.join(snapshot));
            }
        }
        Ok(file)
    }
}

#[derive(Default)]
struct InventoryState {
    providers: BTreeMap<String, ProviderEntry>,
    regions: BTreeMap<String, Region>,
}

/// Shared lookup of providers and regions.
#[derive(Default)]
pub struct Inventory {
    state: RwLock<InventoryState>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(file: InventoryFile) -> Self {
        let inventory = Self::new();
        for entry in file.providers {
            inventory.add_entry(entry);
        }
        inventory
    }

    fn read(&self) -> RwLockReadGuard<'_, InventoryState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, InventoryState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add_entry(&self, entry: ProviderEntry) {
        let mut state = self.write();
        for region in &entry.regions {
            state.regions.insert(region.id.clone(), region.clone());
        }
        state.providers.insert(entry.provider.id.clone(), entry);
    }

    pub fn add_provider(&self, provider: Provider, regions: Vec<Region>) {
        self.add_entry(ProviderEntry {
            provider,
            regions,
            kinds: Vec::new(),
        });
    }

    /// Replace a provider's settings, keeping its regions.
    pub fn update_provider(&self, provider: Provider) -> Result<(), InventoryError> {
        let mut state = self.write();
        let entry = state
            .providers
            .get_mut(&provider.id)
            .ok_or_else(|| InventoryError::UnknownProvider(provider.id.clone()))?;
        entry.provider = provider;
        Ok(())
    }

    pub fn provider(&self, id: &str) -> Result<Provider, InventoryError> {
        self.read()
            .providers
            .get(id)
            .map(|e| e.provider.clone())
            .ok_or_else(|| InventoryError::UnknownProvider(id.to_string()))
    }

    pub fn entry(&self, id: &str) -> Result<ProviderEntry, InventoryError> {
        self.read()
            .providers
            .get(id)
            .cloned()
            .ok_or_else(|| InventoryError::UnknownProvider(id.to_string()))
    }

    pub fn providers(&self) -> Vec<Provider> {
        self.read()
            .providers
            .values()
            .map(|e| e.provider.clone())
            .collect()
    }

    pub fn region(&self, id: &str) -> Result<Region, InventoryError> {
        self.read()
            .regions
            .get(id)
            .cloned()
            .ok_or_else(|| InventoryError::UnknownRegion(id.to_string()))
    }

    pub fn regions_of(&self, provider_id: &str) -> Vec<Region> {
        self.read()
            .providers
            .get(provider_id)
            .map(|e| e.regions.clone())
            .unwrap_or_default()
    }
}
