//! Lifecycle dispatcher.
//!
//! Provider-affecting actions move the row into a transient status and queue
//! a typed task; the task executor calls back into [`Lifecycle::finish_task`]
//! to settle the row. Deletion is two-phase: the row is marked pending,
//! its children are removed, then the row is tombstoned and physically
//! removed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::audit::SyncAuditLogger;
use crate::context::SyncContext;
use crate::driver::{Capability, Driver, DriverRegistry, UpstreamScope};
use crate::error::{IssueKind, Result, SyncError};
use crate::inventory::Inventory;
use crate::lockman::LockManager;
use crate::model::{
    DeletionState, InvalidStatus, InvalidTransition, Managed, Provider, RemoteResource,
    Resource, ResourceKind, Status,
};
use crate::store::{Event, EventBus, ResourceStore, StoreError, UpdateOutcome, update_with_lock};
use crate::task::{LifecycleTask, Task, TaskRuntime, TaskSpec};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("delete of {id} rejected: {reason}")]
    DeleteRejected { id: String, reason: String },

    #[error("{id} has an open task younger than {grace:?}")]
    TaskInFlight { id: String, grace: Duration },

    #[error("provider {0} is read-only")]
    ReadOnlyProvider(String),

    #[error(transparent)]
    InvalidStatus(#[from] InvalidStatus),

    #[error("capability not supported: {0:?}")]
    NotSupported(Capability),

    #[error("{0} has no upstream counterpart")]
    NotPushed(String),

    #[error(transparent)]
    Deletion(#[from] InvalidTransition),
}

impl LifecycleError {
    pub fn issue_kind(&self) -> IssueKind {
        match self {
            LifecycleError::DeleteRejected { .. }
            | LifecycleError::TaskInFlight { .. }
            | LifecycleError::InvalidStatus(_) => IssueKind::Validation,
            LifecycleError::ReadOnlyProvider(_) | LifecycleError::NotSupported(_) => {
                IssueKind::NotSupported
            }
            LifecycleError::NotPushed(_) | LifecycleError::Deletion(_) => IssueKind::Invariant,
        }
    }
}

/// A rule that may veto deleting a row.
#[async_trait]
pub trait DeleteCondition: Send + Sync {
    /// `Err` carries the human-readable reason.
    async fn check(&self, store: &dyn ResourceStore, row: &Resource) -> std::result::Result<(), String>;
}

/// Delete prevention flag, provider default objects, and live references.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardDeleteCondition;

#[async_trait]
impl DeleteCondition for StandardDeleteCondition {
    async fn check(&self, _store: &dyn ResourceStore, row: &Resource) -> std::result::Result<(), String> {
        if row.disable_delete {
            return Err("delete prevention is enabled".to_string());
        }
        if row.is_default() {
            return Err("default resource is protected".to_string());
        }
        if row.ref_count > 0 {
            return Err(format!("referenced by {} resources", row.ref_count));
        }
        Ok(())
    }
}

/// Refuses to delete a row while active rows of another kind point at it
/// through `attribute`. The attribute holds the row's local or external id,
/// or a list of them.
pub struct ReferencedBy {
    pub kind: ResourceKind,
    pub attribute: String,
}

impl ReferencedBy {
    pub fn new(kind: ResourceKind, attribute: &str) -> Self {
        Self {
            kind,
            attribute: attribute.to_string(),
        }
    }

    fn points_at(&self, user: &Resource, row: &Resource) -> bool {
        let is_row = |v: &serde_json::Value| {
            v.as_str()
                .is_some_and(|id| id == row.id || Some(id) == row.external_id())
        };
        match user.attributes.get(&self.attribute) {
            Some(serde_json::Value::Array(ids)) => ids.iter().any(|v| is_row(v)),
            Some(v) => is_row(v),
            None => false,
        }
    }
}

#[async_trait]
impl DeleteCondition for ReferencedBy {
    async fn check(&self, store: &dyn ResourceStore, row: &Resource) -> std::result::Result<(), String> {
        let scope = crate::store::ScopeFilter::Scope {
            provider_id: row.managed.provider_id.clone(),
            region_id: row.region.region_id.clone(),
        };
        let users = store
            .list_by_scope(self.kind, &scope)
            .await
            .map_err(|e| e.to_string())?;
        if let Some(user) = users
            .iter()
            .find(|u| u.is_active() && self.points_at(u, row))
        {
            return Err(format!("still used by {} {}", self.kind, user.id));
        }
        Ok(())
    }
}

/// Delete conditions: a common set plus extra rules per kind.
#[derive(Clone)]
pub struct DeleteConditions {
    common: Vec<Arc<dyn DeleteCondition>>,
    per_kind: HashMap<ResourceKind, Vec<Arc<dyn DeleteCondition>>>,
}

impl DeleteConditions {
    /// The standard checks plus the guest references every provider has:
    /// disks and security groups stay while a guest uses them.
    pub fn new() -> Self {
        let mut conditions = Self::empty();
        conditions.register(
            ResourceKind::Disk,
            Arc::new(ReferencedBy::new(ResourceKind::Guest, "disk_ids")),
        );
        conditions.register(
            ResourceKind::SecurityGroup,
            Arc::new(ReferencedBy::new(ResourceKind::Guest, "security_group_ids")),
        );
        conditions
    }

    /// Only the standard checks.
    pub fn empty() -> Self {
        Self {
            common: vec![Arc::new(StandardDeleteCondition)],
            per_kind: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: ResourceKind, condition: Arc<dyn DeleteCondition>) {
        self.per_kind.entry(kind).or_default().push(condition);
    }

    async fn check(&self, store: &dyn ResourceStore, row: &Resource) -> std::result::Result<(), String> {
        for condition in &self.common {
            condition.check(store, row).await?;
        }
        if let Some(conditions) = self.per_kind.get(&row.kind) {
            for condition in conditions {
                condition.check(store, row).await?;
            }
        }
        Ok(())
    }
}

impl Default for DeleteConditions {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a row lives upstream.
pub struct Upstream {
    pub provider: Provider,
    pub driver: Arc<dyn Driver>,
    pub scope: UpstreamScope,
}

pub struct Lifecycle {
    store: Arc<dyn ResourceStore>,
    tasks: Arc<dyn TaskRuntime>,
    registry: Arc<DriverRegistry>,
    inventory: Arc<Inventory>,
    locks: LockManager,
    events: EventBus,
    audit: SyncAuditLogger,
    conditions: DeleteConditions,
    grace: Duration,
}

impl Lifecycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ResourceStore>,
        tasks: Arc<dyn TaskRuntime>,
        registry: Arc<DriverRegistry>,
        inventory: Arc<Inventory>,
        locks: LockManager,
        events: EventBus,
        audit: SyncAuditLogger,
        conditions: DeleteConditions,
        grace: Duration,
    ) -> Self {
        Self {
            store,
            tasks,
            registry,
            inventory,
            locks,
            events,
            audit,
            conditions,
            grace,
        }
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    pub fn tasks(&self) -> &Arc<dyn TaskRuntime> {
        &self.tasks
    }

    pub fn grace_period(&self) -> Duration {
        self.grace
    }

    fn depth(&self, kind: ResourceKind) -> u32 {
        self.registry.graph().depth(kind)
    }

    /// Provider, driver and upstream scope of `row`. `None` for rows without
    /// a provider (on-premise).
    pub fn upstream_of(&self, row: &Resource) -> Result<Option<Upstream>> {
        let Some(provider_id) = row.managed.provider_id.as_deref() else {
            return Ok(None);
        };
        let provider = self.inventory.provider(provider_id)?;
        if provider.kind.is_on_premise() {
            return Ok(None);
        }
        let region = match row.region.region_id.as_deref() {
            Some(id) => Some(self.inventory.region(id)?),
            None => None,
        };
        let driver = self.registry.lookup(provider.kind, row.kind)?;
        let scope = UpstreamScope {
            provider_id: provider.id.clone(),
            credential: provider.credential.clone(),
            region,
        };
        Ok(Some(Upstream {
            provider,
            driver,
            scope,
        }))
    }

    /// Whether `row` has an open task younger than the grace period.
    pub async fn has_task_in_flight(&self, row_id: &str) -> Result<bool> {
        let since = Utc::now() - chrono::Duration::from_std(self.grace).unwrap_or(chrono::Duration::zero());
        Ok(self.tasks.query_tasks_of_object(row_id, since, true).await? > 0)
    }

    pub async fn validate_delete_condition(&self, row: &Resource) -> std::result::Result<(), String> {
        self.conditions.check(self.store.as_ref(), row).await
    }

    /// Move `id` to `status`. Failed statuses always carry a reason.
    pub async fn set_status(
        &self,
        ctx: &SyncContext,
        id: &str,
        status: Status,
        reason: Option<&str>,
    ) -> Result<Resource> {
        let kind = self.store.get(id).await?.kind;
        let reason = match (status.is_failed(), reason) {
            (true, None) => Some(status.as_str()),
            (_, reason) => reason,
        };
        let mut from = None;
        let outcome = update_with_lock(
            self.store.as_ref(),
            &self.locks,
            ctx,
            kind,
            self.depth(kind),
            id,
            |row| {
                if row.status == status && row.status_reason.as_deref() == reason {
                    return Vec::new();
                }
                from = Some(row.status);
                row.status = status;
                row.status_reason = reason.map(str::to_string);
                vec!["status"]
            },
        )
        .await?;

        if let (UpdateOutcome::Updated { row, .. }, Some(from)) = (&outcome, from) {
            if from != status {
                self.events.emit(Event::StatusChanged {
                    kind,
                    id: id.to_string(),
                    from,
                    to: status,
                    reason: reason.map(str::to_string),
                });
                self.audit.status_changed(kind, &row.id, from, status, reason);
            }
        }
        Ok(outcome.row().clone())
    }

    /// String form used at the API edge; unknown statuses are rejected.
    pub async fn set_status_str(
        &self,
        ctx: &SyncContext,
        id: &str,
        status: &str,
        reason: Option<&str>,
    ) -> Result<Resource> {
        let status: Status = status.parse().map_err(LifecycleError::InvalidStatus)?;
        self.set_status(ctx, id, status, reason).await
    }

    async fn advance_deletion(
        &self,
        ctx: &SyncContext,
        row: &Resource,
        to: DeletionState,
    ) -> Result<UpdateOutcome> {
        update_with_lock(
            self.store.as_ref(),
            &self.locks,
            ctx,
            row.kind,
            self.depth(row.kind),
            &row.id,
            |r| match r.deletion.advance(to) {
                Ok(next) => {
                    r.deletion = next;
                    vec!["deletion"]
                }
                Err(_) => Vec::new(),
            },
        )
        .await
    }

    async fn descendants(&self, root: &str) -> Result<Vec<Resource>> {
        let mut out = Vec::new();
        let mut frontier = vec![root.to_string()];
        while let Some(id) = frontier.pop() {
            for child in self.store.list_children(&id, None).await? {
                frontier.push(child.id.clone());
                out.push(child);
            }
        }
        Ok(out)
    }

    /// Two-phase hard delete of `row` and everything below it. Returns the
    /// removed ids, children first. Any failure before the row is
    /// tombstoned puts it back to active.
    pub async fn real_delete(&self, ctx: &SyncContext, row: &Resource) -> Result<Vec<String>> {
        match self.advance_deletion(ctx, row, DeletionState::PendingDelete).await {
            Ok(_) => {}
            Err(SyncError::Store(StoreError::NotFound(_))) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        let mut removed = match self.remove_descendants(row).await {
            Ok(removed) => removed,
            Err(e) => {
                self.restore(ctx, row, &e).await;
                return Err(e);
            }
        };
        if let Err(e) = self.advance_deletion(ctx, row, DeletionState::Tombstoned).await {
            self.restore(ctx, row, &e).await;
            return Err(e);
        }

        // Left tombstoned if the final removal fails; the next reconcile of
        // the scope sweeps it.
        self.store.real_delete(std::slice::from_ref(&row.id)).await?;
        self.events.emit(Event::SyncDelete {
            kind: row.kind,
            id: row.id.clone(),
            external_id: row.external_id().map(str::to_string),
        });
        let children = removed.len();
        removed.push(row.id.clone());
        self.audit.sync_deleted(row.kind, &removed);
        debug!(kind = %row.kind, id = %row.id, children, "Row deleted");
        Ok(removed)
    }

    /// Physically remove every row below `row` in one store write.
    async fn remove_descendants(&self, row: &Resource) -> Result<Vec<String>> {
        let children = self.descendants(&row.id).await?;
        if children.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = children.iter().map(|c| c.id.clone()).collect();
        self.store.real_delete(&ids).await?;
        for child in &children {
            self.events.emit(Event::SyncDelete {
                kind: child.kind,
                id: child.id.clone(),
                external_id: child.external_id().map(str::to_string),
            });
        }
        Ok(ids)
    }

    /// Undo a started delete. Runs detached so a cancelled caller cannot
    /// leave the row pending.
    async fn restore(&self, ctx: &SyncContext, row: &Resource, cause: &SyncError) {
        warn!(id = %row.id, error = %cause, "Delete failed, restoring row");
        if let Err(e) = self
            .advance_deletion(&ctx.detached(), row, DeletionState::Active)
            .await
        {
            error!(id = %row.id, error = %e, "Failed to restore row after delete failure");
        }
    }

    async fn dispatch(
        &self,
        ctx: &SyncContext,
        row: &Resource,
        payload: LifecycleTask,
        upstream: &Upstream,
        parent_task_id: Option<String>,
    ) -> Result<Task> {
        let failure_status = match payload {
            LifecycleTask::Create => Status::CreateFailed,
            LifecycleTask::Delete { .. } => Status::DeleteFailed,
            LifecycleTask::SyncStatus | LifecycleTask::RemoteUpdate { .. } => Status::Unknown,
        };
        let spec = TaskSpec {
            kind: row.kind,
            object_id: row.id.clone(),
            credential: upstream.provider.credential.clone(),
            payload,
            parent_task_id,
        };
        let queued = match self.tasks.new_task(spec).await {
            Ok(task) => match self.tasks.schedule_run(&task.id).await {
                Ok(()) => Ok(task),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        match queued {
            Ok(task) => {
                self.events.emit(Event::TaskScheduled {
                    task_id: task.id.clone(),
                    name: task.name.clone(),
                    object_id: row.id.clone(),
                });
                self.audit.task_dispatched(&task.name, &task.id, &row.id);
                info!(task = %task.name, task_id = %task.id, object = %row.id, trace_id = %ctx.trace_id(), "Task queued");
                Ok(task)
            }
            Err(e) => {
                let reason = e.to_string();
                self.set_status(ctx, &row.id, failure_status, Some(&reason)).await?;
                Err(e.into())
            }
        }
    }

    fn require_writable(&self, upstream: &Upstream, cap: Capability) -> Result<()> {
        if upstream.provider.read_only {
            return Err(LifecycleError::ReadOnlyProvider(upstream.provider.id.clone()).into());
        }
        if !upstream.driver.supports(cap) {
            return Err(LifecycleError::NotSupported(cap).into());
        }
        Ok(())
    }

    /// Insert `row` as `creating` and queue its create task.
    pub async fn start_create(
        &self,
        ctx: &SyncContext,
        mut row: Resource,
        parent_task_id: Option<String>,
    ) -> Result<Task> {
        let upstream = self
            .upstream_of(&row)?
            .ok_or(LifecycleError::NotSupported(Capability::Create))?;
        self.require_writable(&upstream, Capability::Create)?;

        row.status = Status::Creating;
        row.status_reason = None;
        row.managed.external_id = None;
        let row = self.store.insert(row).await?;
        self.dispatch(ctx, &row, LifecycleTask::Create, &upstream, parent_task_id)
            .await
    }

    /// Delete `id`. Rows without an upstream counterpart, and purges, are
    /// removed right away (`Ok(None)`); others go to `deleting` and get a
    /// delete task.
    pub async fn start_delete(
        &self,
        ctx: &SyncContext,
        id: &str,
        purge: bool,
        parent_task_id: Option<String>,
    ) -> Result<Option<Task>> {
        let row = self.store.get(id).await?;
        if let Err(reason) = self.validate_delete_condition(&row).await {
            return Err(LifecycleError::DeleteRejected {
                id: id.to_string(),
                reason,
            }
            .into());
        }

        let upstream = match self.upstream_of(&row)? {
            Some(upstream) if !purge && row.external_id().is_some() => upstream,
            _ => {
                self.real_delete(ctx, &row).await?;
                return Ok(None);
            }
        };
        self.require_writable(&upstream, Capability::Delete)?;

        let row = self.set_status(ctx, id, Status::Deleting, None).await?;
        self.dispatch(ctx, &row, LifecycleTask::Delete { purge }, &upstream, parent_task_id)
            .await
            .map(Some)
    }

    /// Refresh `id` from upstream. Refused while another task on the row is
    /// younger than the grace period.
    pub async fn start_sync_status(&self, ctx: &SyncContext, id: &str) -> Result<Task> {
        if self.has_task_in_flight(id).await? {
            return Err(LifecycleError::TaskInFlight {
                id: id.to_string(),
                grace: self.grace,
            }
            .into());
        }
        let row = self.store.get(id).await?;
        let upstream = match self.upstream_of(&row)? {
            Some(upstream) if row.external_id().is_some() => upstream,
            _ => return Err(LifecycleError::NotPushed(id.to_string()).into()),
        };
        if !upstream.driver.supports(Capability::GetOne) {
            return Err(LifecycleError::NotSupported(Capability::GetOne).into());
        }
        let row = self.set_status(ctx, id, Status::Syncing, None).await?;
        self.dispatch(ctx, &row, LifecycleTask::SyncStatus, &upstream, None)
            .await
    }

    /// Push local tags upstream.
    pub async fn start_remote_update(
        &self,
        ctx: &SyncContext,
        id: &str,
        replace_tags: bool,
    ) -> Result<Task> {
        let row = self.store.get(id).await?;
        let upstream = match self.upstream_of(&row)? {
            Some(upstream) if row.external_id().is_some() => upstream,
            _ => return Err(LifecycleError::NotPushed(id.to_string()).into()),
        };
        self.require_writable(&upstream, Capability::UpdateTags)?;
        let row = self.set_status(ctx, id, Status::UpdateTags, None).await?;
        self.dispatch(
            ctx,
            &row,
            LifecycleTask::RemoteUpdate { replace_tags },
            &upstream,
            None,
        )
        .await
    }

    /// Settle a row after its task ran. `outcome` carries the upstream
    /// object when the task produced one, or the provider error text.
    pub async fn finish_task(
        &self,
        ctx: &SyncContext,
        task: &Task,
        outcome: std::result::Result<Option<RemoteResource>, String>,
    ) -> Result<()> {
        let id = task.object_id.as_str();
        self.audit
            .task_finished(&task.name, &task.id, outcome.as_ref().err().map(String::as_str));

        match (&task.payload, outcome) {
            (LifecycleTask::Delete { .. }, Ok(_)) => {
                let row = match self.store.get(id).await {
                    Ok(row) => row,
                    Err(StoreError::NotFound(_)) => return Ok(()),
                    Err(e) => return Err(e.into()),
                };
                self.real_delete(ctx, &row).await?;
            }
            (LifecycleTask::Create, Ok(Some(remote))) => {
                let from = self.store.get(id).await?.status;
                let outcome = update_with_lock(
                    self.store.as_ref(),
                    &self.locks,
                    ctx,
                    task.kind,
                    self.depth(task.kind),
                    id,
                    |row| {
                        row.managed.external_id = Some(remote.global_id.clone());
                        let mut fields = row.apply_remote(&remote, false);
                        fields.push("external_id");
                        row.last_seen = Some(Utc::now());
                        fields
                    },
                )
                .await?;
                let row = outcome.row();
                self.events.emit(Event::StatusChanged {
                    kind: task.kind,
                    id: id.to_string(),
                    from,
                    to: row.status,
                    reason: None,
                });
                self.audit.status_changed(task.kind, id, from, row.status, None);
            }
            (LifecycleTask::SyncStatus, Ok(Some(remote))) => {
                let kind = task.kind;
                let from = self.store.get(id).await?.status;
                let outcome = update_with_lock(
                    self.store.as_ref(),
                    &self.locks,
                    ctx,
                    kind,
                    self.depth(kind),
                    id,
                    |row| {
                        // Syncing is not a mirrored value; always settle it.
                        row.status = Status::Unknown;
                        let mut fields = row.apply_remote(&remote, false);
                        if !fields.contains(&"status") {
                            fields.push("status");
                        }
                        fields
                    },
                )
                .await?;
                let to = outcome.row().status;
                if from != to {
                    self.events.emit(Event::StatusChanged {
                        kind,
                        id: id.to_string(),
                        from,
                        to,
                        reason: None,
                    });
                    self.audit.status_changed(kind, id, from, to, None);
                }
            }
            (LifecycleTask::Create, Ok(None))
            | (LifecycleTask::SyncStatus, Ok(None))
            | (LifecycleTask::RemoteUpdate { .. }, Ok(_)) => {
                self.set_status(ctx, id, Status::Available, None).await?;
            }
            (LifecycleTask::Create, Err(e)) => {
                self.set_status(ctx, id, Status::CreateFailed, Some(&e)).await?;
            }
            (LifecycleTask::Delete { .. }, Err(e)) => {
                self.set_status(ctx, id, Status::DeleteFailed, Some(&e)).await?;
            }
            (LifecycleTask::SyncStatus, Err(e)) | (LifecycleTask::RemoteUpdate { .. }, Err(e)) => {
                self.set_status(ctx, id, Status::Unknown, Some(&e)).await?;
            }
        }
        Ok(())
    }
}
