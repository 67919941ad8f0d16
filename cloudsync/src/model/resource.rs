//! Local mirror rows and their upstream counterparts.
//!
//! A [`Resource`] carries its column bundles as inline sub-records
//! ([`ManagedInfo`], [`RegionInfo`], [`OwnerInfo`]). Code that only cares
//! about one bundle goes through the accessor traits instead of the
//! concrete type.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::kind::ResourceKind;
use super::status::Status;

/// Link to the provider that owns the upstream object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedInfo {
    /// `None` for on-premise resources.
    pub provider_id: Option<String>,
    /// Provider's stable identifier. Empty until the upstream object exists.
    pub external_id: Option<String>,
    /// Upstream project the provider reported, used for project mapping.
    pub external_project_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionInfo {
    pub region_id: Option<String>,
    pub zone_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerInfo {
    pub domain_id: String,
    pub project_id: Option<String>,
}

pub trait Managed {
    fn managed_info(&self) -> &ManagedInfo;

    /// External id, treating the empty string as absent.
    fn external_id(&self) -> Option<&str> {
        self.managed_info()
            .external_id
            .as_deref()
            .filter(|s| !s.is_empty())
    }
}

pub trait Regional {
    fn region_info(&self) -> &RegionInfo;
}

pub trait Owned {
    fn owner_info(&self) -> &OwnerInfo;
}

/// Two-phase delete states of a local row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionState {
    #[default]
    Active,
    /// Marked for deletion; children are being cascaded.
    PendingDelete,
    /// Children are gone; the row is about to be physically removed.
    Tombstoned,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid deletion transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: DeletionState,
    pub to: DeletionState,
}

impl DeletionState {
    pub fn advance(self, to: DeletionState) -> Result<DeletionState, InvalidTransition> {
        use DeletionState::*;
        match (self, to) {
            (Active, PendingDelete) | (PendingDelete, Tombstoned) | (PendingDelete, Active) => {
                Ok(to)
            }
            (from, to) => Err(InvalidTransition { from, to }),
        }
    }
}

/// A persisted mirror row. Child resources are rows with `parent_id` set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub kind: ResourceKind,
    pub name: String,
    #[serde(default)]
    pub managed: ManagedInfo,
    #[serde(default)]
    pub region: RegionInfo,
    #[serde(default)]
    pub owner: OwnerInfo,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub status: Status,
    /// Human-readable reason for the last transition into a failed status.
    #[serde(default)]
    pub status_reason: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub disable_delete: bool,
    /// Number of foreign rows that reference this one.
    #[serde(default)]
    pub ref_count: u32,
    #[serde(default)]
    pub deletion: DeletionState,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

fn default_true() -> bool {
    true
}

impl Resource {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            name: name.into(),
            managed: ManagedInfo::default(),
            region: RegionInfo::default(),
            owner: OwnerInfo::default(),
            parent_id: None,
            status: Status::Available,
            status_reason: None,
            enabled: true,
            disable_delete: false,
            ref_count: 0,
            deletion: DeletionState::Active,
            attributes: BTreeMap::new(),
            tags: BTreeMap::new(),
            last_seen: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_external(mut self, provider_id: &str, external_id: &str) -> Self {
        self.managed.provider_id = Some(provider_id.to_string());
        self.managed.external_id = Some(external_id.to_string());
        self
    }

    pub fn with_region(mut self, region_id: &str) -> Self {
        self.region.region_id = Some(region_id.to_string());
        self
    }

    pub fn with_domain(mut self, domain_id: &str) -> Self {
        self.owner.domain_id = domain_id.to_string();
        self
    }

    pub fn with_parent(mut self, parent_id: &str) -> Self {
        self.parent_id = Some(parent_id.to_string());
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn with_disable_delete(mut self, disable_delete: bool) -> Self {
        self.disable_delete = disable_delete;
        self
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn is_active(&self) -> bool {
        self.deletion == DeletionState::Active
    }

    /// Attribute marking a provider default object that must never be removed.
    pub fn is_default(&self) -> bool {
        matches!(self.attributes.get("is_default"), Some(Value::Bool(true)))
    }

    /// Copy mirrored fields from `remote` into `self` and return the names of
    /// the fields that changed. Local-only fields (owner, project, flags) are
    /// left alone; the name only follows upstream when `sync_name` is set.
    ///
    /// A matched upstream object clears `delete_failed`. `create_failed` is
    /// kept until a user action clears it.
    pub fn apply_remote(&mut self, remote: &RemoteResource, sync_name: bool) -> Vec<&'static str> {
        let mut changed = Vec::new();

        let status = remote.status.unwrap_or(Status::Available);
        if self.status != status && self.status != Status::CreateFailed {
            self.status = status;
            self.status_reason = None;
            changed.push("status");
        }
        if sync_name && !remote.name.is_empty() && self.name != remote.name {
            self.name = remote.name.clone();
            changed.push("name");
        }
        if remote.zone_id.is_some() && self.region.zone_id != remote.zone_id {
            self.region.zone_id = remote.zone_id.clone();
            changed.push("zone_id");
        }
        if self.managed.external_project_id != remote.project_id {
            self.managed.external_project_id = remote.project_id.clone();
            changed.push("external_project_id");
        }
        if self.attributes != remote.attributes {
            self.attributes = remote.attributes.clone();
            changed.push("attributes");
        }
        changed
    }
}

impl Managed for Resource {
    fn managed_info(&self) -> &ManagedInfo {
        &self.managed
    }
}

impl Regional for Resource {
    fn region_info(&self) -> &RegionInfo {
        &self.region
    }
}

impl Owned for Resource {
    fn owner_info(&self) -> &OwnerInfo {
        &self.owner
    }
}

/// An object as reported by a provider driver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteResource {
    pub global_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: Option<Status>,
    #[serde(default)]
    pub zone_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl RemoteResource {
    pub fn new(global_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            global_id: global_id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_zone(mut self, zone_id: &str) -> Self {
        self.zone_id = Some(zone_id.to_string());
        self
    }

    pub fn with_project(mut self, project_id: &str) -> Self {
        self.project_id = Some(project_id.to_string());
        self
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deletion_state_machine() {
        let s = DeletionState::Active;
        let s = s.advance(DeletionState::PendingDelete).unwrap();
        assert_eq!(s.advance(DeletionState::Active), Ok(DeletionState::Active));
        let s = s.advance(DeletionState::Tombstoned).unwrap();
        assert!(s.advance(DeletionState::Active).is_err());
        assert!(
            DeletionState::Active
                .advance(DeletionState::Tombstoned)
                .is_err()
        );
    }

    #[test]
    fn test_apply_remote_reports_changed_fields() {
        let mut local = Resource::new(ResourceKind::WafInstance, "w")
            .with_external("p1", "w-1")
            .with_attr("port", 80);
        let remote = RemoteResource::new("w-1", "w-renamed")
            .with_status(Status::SoldOut)
            .with_attr("port", 80);

        let changed = local.apply_remote(&remote, false);
        assert_eq!(changed, vec!["status"]);
        assert_eq!(local.status, Status::SoldOut);
        assert_eq!(local.name, "w");

        assert!(local.apply_remote(&remote, false).is_empty());
        assert_eq!(local.apply_remote(&remote, true), vec!["name"]);
    }

    #[test]
    fn test_apply_remote_clears_delete_failed_only() {
        let remote = RemoteResource::new("d-1", "d");

        let mut local = Resource::new(ResourceKind::Disk, "d")
            .with_external("p1", "d-1")
            .with_status(Status::DeleteFailed);
        local.status_reason = Some("busy".into());
        assert_eq!(local.apply_remote(&remote, false), vec!["status"]);
        assert_eq!(local.status, Status::Available);
        assert!(local.status_reason.is_none());

        let mut local = Resource::new(ResourceKind::Disk, "d")
            .with_external("p1", "d-1")
            .with_status(Status::CreateFailed);
        assert!(local.apply_remote(&remote, false).is_empty());
        assert_eq!(local.status, Status::CreateFailed);
    }

    #[test]
    fn test_empty_external_id_is_absent() {
        let mut r = Resource::new(ResourceKind::Disk, "d");
        assert_eq!(r.external_id(), None);
        r.managed.external_id = Some(String::new());
        assert_eq!(r.external_id(), None);
        r.managed.external_id = Some("x".into());
        assert_eq!(r.external_id(), Some("x"));
    }
}
