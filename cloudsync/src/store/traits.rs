//! Persistence contract used by the engine.
//!
//! The engine is storage-agnostic: anything that can list rows by scope,
//! look them up by identity and apply versioned writes can back it.

use async_trait::async_trait;

use super::error::Result;
use crate::model::{Resource, ResourceKind};

/// Which rows a reconcile sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeFilter {
    /// Top-level rows of a provider, optionally narrowed to a region.
    /// `provider_id` is `None` for on-premise rows.
    Scope {
        provider_id: Option<String>,
        region_id: Option<String>,
    },
    /// Children of a parent row.
    Parent(String),
}

impl ScopeFilter {
    pub fn matches(&self, row: &Resource) -> bool {
        match self {
            ScopeFilter::Scope {
                provider_id,
                region_id,
            } => {
                row.parent_id.is_none()
                    && &row.managed.provider_id == provider_id
                    && &row.region.region_id == region_id
            }
            ScopeFilter::Parent(parent) => row.parent_id.as_deref() == Some(parent.as_str()),
        }
    }
}

#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Every row of `kind` in the scope, whatever its deletion state.
    async fn list_by_scope(&self, kind: ResourceKind, filter: &ScopeFilter) -> Result<Vec<Resource>>;

    /// Active row of `kind` under `provider_id` with the given external id.
    async fn fetch_by_external_id(
        &self,
        kind: ResourceKind,
        provider_id: &str,
        external_id: &str,
    ) -> Result<Option<Resource>>;

    async fn get(&self, id: &str) -> Result<Resource>;

    /// Lookup by local id, then by name within `domain_id` when given.
    async fn fetch_by_id_or_name(
        &self,
        kind: ResourceKind,
        ident: &str,
        domain_id: Option<&str>,
    ) -> Result<Option<Resource>>;

    /// Whether an active row of `kind` in `domain_id` already uses `name`.
    async fn name_in_use(&self, kind: ResourceKind, domain_id: &str, name: &str) -> Result<bool>;

    /// Insert a new row. Rejects a duplicate external id within
    /// `(provider, region, kind)` and a child whose parent is missing or
    /// tombstoned.
    async fn insert(&self, resource: Resource) -> Result<Resource>;

    /// Write `resource` if its version still matches the stored one. The
    /// stored version is bumped.
    async fn update(&self, resource: Resource) -> Result<Resource>;

    /// All rows whose parent is `parent_id`, optionally of one kind.
    async fn list_children(
        &self,
        parent_id: &str,
        child_kind: Option<ResourceKind>,
    ) -> Result<Vec<Resource>>;

    /// Physically remove `ids` in one step. Fails without removing anything
    /// if a row is missing or still has children outside `ids`.
    async fn real_delete(&self, ids: &[String]) -> Result<usize>;
}
