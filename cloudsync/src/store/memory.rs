//! In-memory resource store.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::error::{Result, StoreError};
use super::traits::{ResourceStore, ScopeFilter};
use crate::model::{DeletionState, Managed, Resource, ResourceKind};

/// Store calls a failure can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Insert,
    Update,
    ListChildren,
    RealDelete,
}

struct Injected {
    /// Calls that still succeed before the failure fires.
    skip: usize,
    err: StoreError,
}

/// Rows kept in a map behind a tokio `RwLock`. Each write is applied in one
/// step under the write lock, so a row is either fully written or untouched.
pub struct MemoryStore {
    rows: RwLock<HashMap<String, Resource>>,
    write_latency: Option<Duration>,
    writes: AtomicUsize,
    failures: Mutex<HashMap<StoreOp, Injected>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            write_latency: None,
            writes: AtomicUsize::new(0),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Let `skip` calls of `op` through, then fail the next one with `err`.
    /// Later calls succeed again.
    pub fn fail_once(&self, op: StoreOp, skip: usize, err: StoreError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(op, Injected { skip, err });
        }
    }

    fn injected(&self, op: StoreOp) -> Result<()> {
        let Ok(mut failures) = self.failures.lock() else {
            return Ok(());
        };
        let fire = match failures.get_mut(&op) {
            Some(injected) if injected.skip > 0 => {
                injected.skip -= 1;
                false
            }
            Some(_) => true,
            None => false,
        };
        if !fire {
            return Ok(());
        }
        match failures.remove(&op) {
            Some(injected) => Err(injected.err),
            None => Ok(()),
        }
    }

    /// Every write waits this long before it is applied.
    pub fn with_write_latency(mut self, latency: Duration) -> Self {
        self.write_latency = Some(latency);
        self
    }

    /// Number of successful writes (inserts, updates, deletes).
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn all(&self) -> Vec<Resource> {
        let mut rows: Vec<_> = self.rows.read().await.values().cloned().collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    async fn delay(&self) {
        if let Some(latency) = self.write_latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_identity(rows: &HashMap<String, Resource>, row: &Resource) -> Result<()> {
        let Some(ext) = row.external_id() else {
            return Ok(());
        };
        let clash = rows.values().any(|other| {
            other.id != row.id
                && other.is_active()
                && other.kind == row.kind
                && other.managed.provider_id == row.managed.provider_id
                && other.region.region_id == row.region.region_id
                && other.parent_id == row.parent_id
                && other.external_id() == Some(ext)
        });
        if clash {
            return Err(StoreError::Conflict(format!(
                "{} with external id {} already exists",
                row.kind, ext
            )));
        }
        Ok(())
    }

    fn check_parent(rows: &HashMap<String, Resource>, row: &Resource) -> Result<()> {
        if let Some(parent_id) = &row.parent_id {
            match rows.get(parent_id) {
                Some(p) if p.deletion != DeletionState::Tombstoned => {}
                Some(_) => {
                    return Err(StoreError::Conflict(format!(
                        "parent {} is tombstoned",
                        parent_id
                    )));
                }
                None => {
                    return Err(StoreError::Conflict(format!(
                        "parent {} does not exist",
                        parent_id
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn list_by_scope(&self, kind: ResourceKind, filter: &ScopeFilter) -> Result<Vec<Resource>> {
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .filter(|r| r.kind == kind && filter.matches(r))
            .cloned()
            .collect())
    }

    async fn fetch_by_external_id(
        &self,
        kind: ResourceKind,
        provider_id: &str,
        external_id: &str,
    ) -> Result<Option<Resource>> {
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .find(|r| {
                r.kind == kind
                    && r.is_active()
                    && r.managed.provider_id.as_deref() == Some(provider_id)
                    && r.external_id() == Some(external_id)
            })
            .cloned())
    }

    async fn get(&self, id: &str) -> Result<Resource> {
        self.rows
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn fetch_by_id_or_name(
        &self,
        kind: ResourceKind,
        ident: &str,
        domain_id: Option<&str>,
    ) -> Result<Option<Resource>> {
        let rows = self.rows.read().await;
        if let Some(row) = rows.get(ident).filter(|r| r.kind == kind) {
            return Ok(Some(row.clone()));
        }
        Ok(rows
            .values()
            .find(|r| {
                r.kind == kind
                    && r.is_active()
                    && r.name == ident
                    && domain_id.is_none_or(|d| r.owner.domain_id == d)
            })
            .cloned())
    }

    async fn name_in_use(&self, kind: ResourceKind, domain_id: &str, name: &str) -> Result<bool> {
        let rows = self.rows.read().await;
        Ok(rows.values().any(|r| {
            r.kind == kind && r.is_active() && r.owner.domain_id == domain_id && r.name == name
        }))
    }

    async fn insert(&self, mut resource: Resource) -> Result<Resource> {
        self.delay().await;
        self.injected(StoreOp::Insert)?;
        let mut rows = self.rows.write().await;
        if rows.contains_key(&resource.id) {
            return Err(StoreError::Conflict(format!("id {} already exists", resource.id)));
        }
        Self::check_identity(&rows, &resource)?;
        Self::check_parent(&rows, &resource)?;

        let now = Utc::now();
        resource.version = 1;
        resource.created_at = now;
        resource.updated_at = now;
        rows.insert(resource.id.clone(), resource.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(resource)
    }

    async fn update(&self, mut resource: Resource) -> Result<Resource> {
        self.delay().await;
        self.injected(StoreOp::Update)?;
        let mut rows = self.rows.write().await;
        let current = rows
            .get(&resource.id)
            .ok_or_else(|| StoreError::NotFound(resource.id.clone()))?;
        if current.version != resource.version {
            return Err(StoreError::VersionMismatch {
                expected: resource.version,
                actual: current.version,
            });
        }
        if resource.is_active() {
            Self::check_identity(&rows, &resource)?;
        }

        resource.version += 1;
        resource.updated_at = Utc::now();
        rows.insert(resource.id.clone(), resource.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(resource)
    }

    async fn list_children(
        &self,
        parent_id: &str,
        child_kind: Option<ResourceKind>,
    ) -> Result<Vec<Resource>> {
        self.injected(StoreOp::ListChildren)?;
        let rows = self.rows.read().await;
        let mut children: Vec<_> = rows
            .values()
            .filter(|r| r.parent_id.as_deref() == Some(parent_id))
            .filter(|r| child_kind.is_none_or(|k| r.kind == k))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(children)
    }

    async fn real_delete(&self, ids: &[String]) -> Result<usize> {
        self.delay().await;
        self.injected(StoreOp::RealDelete)?;
        let mut rows = self.rows.write().await;
        for id in ids {
            if !rows.contains_key(id) {
                return Err(StoreError::NotFound(id.clone()));
            }
        }
        let orphaned = rows.values().find(|r| {
            !ids.contains(&r.id)
                && r.parent_id
                    .as_ref()
                    .is_some_and(|p| ids.contains(p))
        });
        if let Some(child) = orphaned {
            return Err(StoreError::Conflict(format!(
                "{} {} still references a deleted parent",
                child.kind, child.id
            )));
        }
        for id in ids {
            rows.remove(id);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> ScopeFilter {
        ScopeFilter::Scope {
            provider_id: Some("p1".into()),
            region_id: Some("r1".into()),
        }
    }

    fn row(ext: &str) -> Resource {
        Resource::new(ResourceKind::AccessGroup, ext)
            .with_external("p1", ext)
            .with_region("r1")
            .with_domain("d1")
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_external_id() {
        let store = MemoryStore::new();
        store.insert(row("ag-1")).await.unwrap();
        let err = store.insert(row("ag-1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_pending_delete_row_frees_external_id() {
        let store = MemoryStore::new();
        let mut first = store.insert(row("ag-1")).await.unwrap();
        first.deletion = DeletionState::PendingDelete;
        store.update(first).await.unwrap();
        store.insert(row("ag-1")).await.unwrap();
        assert_eq!(store.list_by_scope(ResourceKind::AccessGroup, &scope()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_child_requires_live_parent() {
        let store = MemoryStore::new();
        let orphan = Resource::new(ResourceKind::AccessGroupRule, "r").with_parent("missing");
        assert!(store.insert(orphan).await.is_err());

        let mut parent = store.insert(row("ag-1")).await.unwrap();
        parent.deletion = DeletionState::PendingDelete;
        let mut parent = store.update(parent).await.unwrap();
        parent.deletion = DeletionState::Tombstoned;
        store.update(parent.clone()).await.unwrap();
        let child = Resource::new(ResourceKind::AccessGroupRule, "r").with_parent(&parent.id);
        assert!(store.insert(child).await.is_err());
    }

    #[tokio::test]
    async fn test_version_check() {
        let store = MemoryStore::new();
        let r = store.insert(row("ag-1")).await.unwrap();
        let updated = store.update(r.clone()).await.unwrap();
        assert_eq!(updated.version, 2);
        let err = store.update(r).await.unwrap_err();
        assert_eq!(err, StoreError::VersionMismatch { expected: 1, actual: 2 });
    }

    #[tokio::test]
    async fn test_real_delete_is_all_or_nothing() {
        let store = MemoryStore::new();
        let parent = store.insert(row("ag-1")).await.unwrap();
        let child = store
            .insert(Resource::new(ResourceKind::AccessGroupRule, "r").with_parent(&parent.id))
            .await
            .unwrap();

        let err = store.real_delete(&[parent.id.clone()]).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.len().await, 2);

        store.real_delete(&[child.id, parent.id]).await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_lookup_by_id_or_name() {
        let store = MemoryStore::new();
        let r = store.insert(row("ag-1")).await.unwrap();
        let by_id = store
            .fetch_by_id_or_name(ResourceKind::AccessGroup, &r.id, None)
            .await
            .unwrap();
        assert_eq!(by_id.unwrap().id, r.id);
        let by_name = store
            .fetch_by_id_or_name(ResourceKind::AccessGroup, "ag-1", Some("d1"))
            .await
            .unwrap();
        assert_eq!(by_name.unwrap().id, r.id);
        assert!(store.name_in_use(ResourceKind::AccessGroup, "d1", "ag-1").await.unwrap());
        assert!(!store.name_in_use(ResourceKind::AccessGroup, "d2", "ag-1").await.unwrap());
        let by_ext = store
            .fetch_by_external_id(ResourceKind::AccessGroup, "p1", "ag-1")
            .await
            .unwrap();
        assert!(by_ext.is_some());
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let store = MemoryStore::new();
        store.fail_once(StoreOp::Update, 1, StoreError::Internal("disk full".into()));
        let r = store.insert(row("ag-1")).await.unwrap();
        let r = store.update(r).await.unwrap();
        let err = store.update(r.clone()).await.unwrap_err();
        assert_eq!(err, StoreError::Internal("disk full".into()));
        assert_eq!(store.update(r).await.unwrap().version, 3);
    }
}
