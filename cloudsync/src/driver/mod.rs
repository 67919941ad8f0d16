//! Provider drivers.
//!
//! A driver is the only place provider-specific behavior enters the engine.
//! Each one declares which [`Capability`]s it implements; mutating methods
//! default to [`DriverError::NotSupported`] so a missing capability can never
//! pass for a successful call.

pub mod error;
pub mod memory;
pub mod onprem;
pub mod registry;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::SyncContext;
use crate::model::{CredentialHandle, Region, RemoteResource, Resource, ResourceKind};

pub use error::{DriverError, RegistryError, Result};
pub use memory::{CloudSnapshot, MemoryCloud, MemoryDriver};
pub use onprem::OnPremDriver;
pub use registry::{DriverRegistry, KindGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ListUpstream,
    GetOne,
    Create,
    Delete,
    ListChildren,
    UpdateTags,
    GetRegionHandle,
}

impl Capability {
    /// Capabilities that change provider state.
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            Capability::Create | Capability::Delete | Capability::UpdateTags
        )
    }
}

/// Provider feature predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverFeatures {
    /// Certificates are listed per region rather than once per provider.
    pub certificate_belongs_to_region: bool,
    pub supports_cdn: bool,
    pub max_security_group_count: usize,
}

impl Default for DriverFeatures {
    fn default() -> Self {
        Self {
            certificate_belongs_to_region: true,
            supports_cdn: false,
            max_security_group_count: 5,
        }
    }
}

/// Where a driver call is pointed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamScope {
    pub provider_id: String,
    pub credential: CredentialHandle,
    pub region: Option<Region>,
}

impl UpstreamScope {
    /// Stable key for provider-side bookkeeping.
    pub fn key(&self) -> String {
        match &self.region {
            Some(region) => format!("{}/{}", self.provider_id, region.external_id),
            None => self.provider_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionHandle {
    pub region_id: String,
    pub external_id: String,
    pub endpoint: Option<String>,
}

#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, cap: Capability) -> bool;

    fn is_read_only(&self) -> bool {
        false
    }

    fn features(&self) -> DriverFeatures {
        DriverFeatures::default()
    }

    async fn list_upstream(
        &self,
        ctx: &SyncContext,
        kind: ResourceKind,
        scope: &UpstreamScope,
    ) -> Result<Vec<RemoteResource>>;

    async fn get_one(
        &self,
        _ctx: &SyncContext,
        _kind: ResourceKind,
        _scope: &UpstreamScope,
        _external_id: &str,
    ) -> Result<RemoteResource> {
        Err(DriverError::NotSupported(Capability::GetOne))
    }

    async fn create(
        &self,
        _ctx: &SyncContext,
        _kind: ResourceKind,
        _scope: &UpstreamScope,
        _spec: &Resource,
    ) -> Result<RemoteResource> {
        Err(DriverError::NotSupported(Capability::Create))
    }

    async fn delete(
        &self,
        _ctx: &SyncContext,
        _kind: ResourceKind,
        _scope: &UpstreamScope,
        _external_id: &str,
    ) -> Result<()> {
        Err(DriverError::NotSupported(Capability::Delete))
    }

    async fn list_children(
        &self,
        _ctx: &SyncContext,
        _scope: &UpstreamScope,
        _parent: &RemoteResource,
        _child_kind: ResourceKind,
    ) -> Result<Vec<RemoteResource>> {
        Err(DriverError::NotSupported(Capability::ListChildren))
    }

    async fn update_tags(
        &self,
        _ctx: &SyncContext,
        _kind: ResourceKind,
        _scope: &UpstreamScope,
        _external_id: &str,
        _tags: &BTreeMap<String, String>,
        _replace: bool,
    ) -> Result<()> {
        Err(DriverError::NotSupported(Capability::UpdateTags))
    }

    async fn region_handle(&self, _ctx: &SyncContext, _region: &Region) -> Result<RegionHandle> {
        Err(DriverError::NotSupported(Capability::GetRegionHandle))
    }
}
