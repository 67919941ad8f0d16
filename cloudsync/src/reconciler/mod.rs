//! Reconcilers for mirrored resource kinds.
//!
//! A reconcile compares the local mirror rows of one scope with what the
//! provider reports and converges the mirror: rows gone upstream are
//! deleted, matched rows get their mirrored fields refreshed, and new
//! upstream objects get a mirror row. Child kinds are reconciled below each
//! parent while the parent's scope lock is held.

mod cascade;
pub mod result;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::audit::SyncAuditLogger;
use crate::compare::{CompareIssue, compare};
use crate::config::EngineConfig;
use crate::context::SyncContext;
use crate::driver::{Capability, Driver, DriverError, DriverRegistry, UpstreamScope};
use crate::error::{IssueKind, Result, SyncError};
use crate::identity::ProjectResolver;
use crate::lifecycle::Lifecycle;
use crate::lockman::{LockLevel, LockManager};
use crate::metadata::MetadataTagger;
use crate::model::{
    DeletionState, Managed, OwnerInfo, Provider, Region, RemoteResource, Resource, ResourceKind,
    Status,
};
use crate::naming::{NAME_LOCK_KEY, generate_name};
use crate::store::{Event, EventBus, ResourceStore, ScopeFilter, UpdateOutcome, update_with_lock};

pub use result::{ChildSync, Phase, SyncIssue, SyncResult, SyncResultSet};

/// Provider plus optional region a top-level reconcile covers.
#[derive(Debug, Clone)]
pub struct Scope {
    pub provider: Provider,
    pub region: Option<Region>,
}

impl Scope {
    pub fn provider(provider: Provider) -> Self {
        Self {
            provider,
            region: None,
        }
    }

    pub fn region(provider: Provider, region: Region) -> Self {
        Self {
            provider,
            region: Some(region),
        }
    }

    /// Lock key: the provider id, or `provider-region` for regional scopes.
    pub fn key(&self) -> String {
        match &self.region {
            Some(region) => format!("{}-{}", self.provider.id, region.id),
            None => self.provider.id.clone(),
        }
    }

    pub fn is_on_premise(&self) -> bool {
        self.provider.kind.is_on_premise()
    }

    pub fn filter(&self) -> ScopeFilter {
        ScopeFilter::Scope {
            provider_id: (!self.is_on_premise()).then(|| self.provider.id.clone()),
            region_id: self.region.as_ref().map(|r| r.id.clone()),
        }
    }

    pub fn upstream(&self) -> UpstreamScope {
        UpstreamScope {
            provider_id: self.provider.id.clone(),
            credential: self.provider.credential.clone(),
            region: self.region.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    /// Membership-only pass: rows are added and removed, matched rows are
    /// left untouched and no cascade runs below them.
    pub xor: bool,
    /// A user asked for this sync; rows gone upstream are removed through a
    /// delete task where the provider allows it.
    pub user_initiated: bool,
    /// Owner for new mirrors when no mapping decides.
    pub sync_owner: Option<OwnerInfo>,
}

/// Trait for resource reconcilers.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Converge the mirror of `kind` in `scope`. Never fails as a whole: a
    /// scope that cannot be opened comes back `aborted`.
    async fn reconcile(
        &self,
        ctx: &SyncContext,
        kind: ResourceKind,
        scope: &Scope,
        opts: &ReconcileOptions,
    ) -> SyncResult;

    /// Remove a row and everything below it from the mirror.
    async fn finalize(&self, ctx: &SyncContext, id: &str) -> Result<()>;
}

/// One compare-and-converge pass over a set of rows of a single kind.
struct Pass<'a> {
    kind: ResourceKind,
    depth: u32,
    provider: &'a Provider,
    upstream: &'a UpstreamScope,
    driver: Arc<dyn Driver>,
    parent: Option<&'a Resource>,
    opts: &'a ReconcileOptions,
}

/// Reconciler for every mirrored kind, driven by the driver registry.
pub struct ResourceReconciler {
    store: Arc<dyn ResourceStore>,
    registry: Arc<DriverRegistry>,
    locks: LockManager,
    lifecycle: Arc<Lifecycle>,
    events: EventBus,
    audit: SyncAuditLogger,
    projects: Arc<dyn ProjectResolver>,
    tagger: Arc<dyn MetadataTagger>,
    config: EngineConfig,
}

impl ResourceReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ResourceStore>,
        registry: Arc<DriverRegistry>,
        locks: LockManager,
        lifecycle: Arc<Lifecycle>,
        events: EventBus,
        audit: SyncAuditLogger,
        projects: Arc<dyn ProjectResolver>,
        tagger: Arc<dyn MetadataTagger>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            locks,
            lifecycle,
            events,
            audit,
            projects,
            tagger,
            config,
        }
    }

    fn depth(&self, kind: ResourceKind) -> u32 {
        self.registry.graph().depth(kind)
    }

    /// In-flight rows are left to their task until the grace period ends.
    async fn in_flight(&self, row: &Resource, phase: Phase, result: &mut SyncResult) -> bool {
        if !row.status.is_transient() {
            return false;
        }
        match self.lifecycle.has_task_in_flight(&row.id).await {
            Ok(false) => false,
            Ok(true) => {
                debug!(id = %row.id, status = %row.status, "Task in flight, skipping");
                result.skipped += 1;
                true
            }
            Err(e) => {
                result.record(phase, Some(row.id.as_str()), &e);
                result.skipped += 1;
                true
            }
        }
    }

    /// Compare `locals` with `remotes` and run the delete, update and add
    /// branches. Returns early on cancellation with `result.cancelled` set.
    async fn converge(
        &self,
        ctx: &SyncContext,
        pass: &Pass<'_>,
        locals: Vec<Resource>,
        remotes: Vec<RemoteResource>,
        result: &mut SyncResult,
    ) {
        let mut live = Vec::with_capacity(locals.len());
        for row in locals {
            match row.deletion {
                DeletionState::Active => live.push(row),
                // Another delete is mid-flight; its external id is free again.
                DeletionState::PendingDelete => {}
                DeletionState::Tombstoned => {
                    if let Err(e) = self.lifecycle.real_delete(ctx, &row).await {
                        result.record(Phase::Delete, Some(row.id.as_str()), &e);
                    }
                }
            }
        }

        let set = compare(live, remotes, |r: &Resource| r.id.as_str(), |r| r.name.clone());
        for issue in &set.issues {
            let (object, message) = match issue {
                CompareIssue::DuplicateLocal { external_id } => {
                    (external_id.as_str(), "duplicate external id in local rows")
                }
                CompareIssue::DuplicateRemote { global_id } => {
                    (global_id.as_str(), "driver reported a global id twice")
                }
                CompareIssue::MissingGlobalId { name } => {
                    (name.as_str(), "driver reported an object without global id")
                }
            };
            warn!(kind = %pass.kind, object, "{}", message);
            result.issue(IssueKind::Invariant, Phase::Compare, Some(object), message);
        }

        if !self.delete_branch(ctx, pass, set.removed, result).await {
            return;
        }
        if !pass.opts.xor
            && !self
                .update_branch(ctx, pass, set.common_local, set.common_remote, result)
                .await
        {
            return;
        }
        self.add_branch(ctx, pass, set.added, result).await;
    }

    /// Returns `false` once cancelled.
    async fn delete_branch(
        &self,
        ctx: &SyncContext,
        pass: &Pass<'_>,
        removed: Vec<Resource>,
        result: &mut SyncResult,
    ) -> bool {
        let provider_delete = pass.opts.user_initiated
            && !pass.provider.read_only
            && !pass.driver.is_read_only()
            && pass.driver.supports(Capability::Delete);

        for row in removed {
            if ctx.is_cancelled() {
                result.cancelled = true;
                return false;
            }
            if self.in_flight(&row, Phase::Delete, result).await {
                continue;
            }

            if let Err(reason) = self.lifecycle.validate_delete_condition(&row).await {
                info!(kind = %pass.kind, id = %row.id, reason = %reason, "Delete prevented");
                result.delete_errors += 1;
                result.issue(IssueKind::Validation, Phase::Delete, Some(row.id.as_str()), reason.as_str());
                self.audit.delete_prevented(pass.kind, &row.id, &reason);
                if let Err(e) = self
                    .lifecycle
                    .set_status(ctx, &row.id, Status::Unknown, Some(&reason))
                    .await
                {
                    result.record(Phase::Delete, Some(row.id.as_str()), &e);
                }
                continue;
            }

            let outcome = if provider_delete {
                self.lifecycle
                    .start_delete(ctx, &row.id, false, None)
                    .await
                    .map(|_| ())
            } else {
                self.lifecycle.real_delete(ctx, &row).await.map(|_| ())
            };
            match outcome {
                Ok(()) => result.delete += 1,
                Err(e) => {
                    result.delete_errors += 1;
                    result.record(Phase::Delete, Some(row.id.as_str()), &e);
                }
            }
        }
        true
    }

    /// Returns `false` once cancelled.
    async fn update_branch(
        &self,
        ctx: &SyncContext,
        pass: &Pass<'_>,
        locals: Vec<Resource>,
        remotes: Vec<RemoteResource>,
        result: &mut SyncResult,
    ) -> bool {
        for (row, remote) in locals.into_iter().zip(remotes) {
            if ctx.is_cancelled() {
                result.cancelled = true;
                return false;
            }
            if self.in_flight(&row, Phase::Update, result).await {
                continue;
            }
            match self.sync_one(ctx, pass, &row, &remote).await {
                Ok(updated) => {
                    result.update += 1;
                    if let UpdateOutcome::Updated { fields, .. } = &updated {
                        result.changed += 1;
                        self.events.emit(Event::SyncUpdate {
                            kind: pass.kind,
                            id: row.id.clone(),
                            fields: fields.iter().map(|f| f.to_string()).collect(),
                        });
                        self.audit.sync_updated(pass.kind, &row.id, fields);
                    }
                    let row = updated.row().clone();
                    result
                        .children
                        .extend(self.cascade(ctx, pass, &row, &remote).await);
                }
                Err(e) => {
                    if e.is_cancelled() {
                        result.cancelled = true;
                        return false;
                    }
                    result.update_errors += 1;
                    result.record(Phase::Update, Some(row.id.as_str()), &e);
                }
            }
        }
        true
    }

    /// Refresh mirrored fields of `row` from `remote` under the row lock
    /// and queue a tag push if local user tags are missing upstream.
    async fn sync_one(
        &self,
        ctx: &SyncContext,
        pass: &Pass<'_>,
        row: &Resource,
        remote: &RemoteResource,
    ) -> Result<UpdateOutcome> {
        let read_only = pass.provider.read_only || pass.driver.is_read_only();
        let tags = self
            .tagger
            .sync_metadata(ctx, row, remote, read_only)
            .await;

        // Only follow an upstream rename onto a free name. The name lock is
        // held from the check to the write, as for adds.
        let rename = self.config.enable_sync_name
            && !remote.name.is_empty()
            && remote.name != row.name;

        let started = Instant::now();
        let outcome = {
            let _name = if rename {
                Some(
                    self.locks
                        .acquire(ctx, pass.kind.keyword(), NAME_LOCK_KEY, LockLevel::name(pass.depth))
                        .await?,
                )
            } else {
                None
            };
            let sync_name = rename
                && !self
                    .store
                    .name_in_use(pass.kind, &row.owner.domain_id, &remote.name)
                    .await?;
            update_with_lock(
                self.store.as_ref(),
                &self.locks,
                ctx,
                pass.kind,
                pass.depth,
                &row.id,
                |r| {
                    let mut fields = r.apply_remote(remote, sync_name);
                    if r.tags != tags.tags {
                        r.tags = tags.tags.clone();
                        fields.push("tags");
                    }
                    if !fields.is_empty() {
                        r.last_seen = Some(Utc::now());
                    }
                    fields
                },
            )
            .await?
        };
        debug!(id = %row.id, elapsed = ?started.elapsed(), changed = outcome.changed(), "Row synced");

        if tags.push && !read_only && pass.driver.supports(Capability::UpdateTags) {
            self.lifecycle
                .start_remote_update(ctx, &row.id, false)
                .await?;
        }
        Ok(outcome)
    }

    async fn add_branch(
        &self,
        ctx: &SyncContext,
        pass: &Pass<'_>,
        added: Vec<RemoteResource>,
        result: &mut SyncResult,
    ) {
        for remote in added {
            if ctx.is_cancelled() {
                result.cancelled = true;
                return;
            }
            match self.add_one(ctx, pass, &remote).await {
                Ok(row) => {
                    result.add += 1;
                    result
                        .children
                        .extend(self.cascade(ctx, pass, &row, &remote).await);
                }
                Err(e) => {
                    if e.is_cancelled() {
                        result.cancelled = true;
                        return;
                    }
                    result.add_errors += 1;
                    result.record(Phase::Add, Some(remote.global_id.as_str()), &e);
                }
            }
        }
    }

    /// Create the mirror row of `remote` under a fresh unique name.
    async fn add_one(
        &self,
        ctx: &SyncContext,
        pass: &Pass<'_>,
        remote: &RemoteResource,
    ) -> Result<Resource> {
        let mut row = Resource::new(pass.kind, remote.name.clone())
            .with_external(&pass.provider.id, &remote.global_id);
        match pass.parent {
            Some(parent) => {
                row.parent_id = Some(parent.id.clone());
                row.region = parent.region.clone();
                row.owner = parent.owner.clone();
            }
            None => {
                row.region.region_id = pass.upstream.region.as_ref().map(|r| r.id.clone());
                self.projects
                    .sync_cloud_project(ctx, &mut row, pass.opts.sync_owner.as_ref(), remote, pass.provider)
                    .await;
            }
        }
        row.apply_remote(remote, false);
        let read_only = pass.provider.read_only || pass.driver.is_read_only();
        row.tags = self
            .tagger
            .sync_metadata(ctx, &row, remote, read_only)
            .await
            .tags;
        row.last_seen = Some(Utc::now());

        let base = if remote.name.is_empty() {
            remote.global_id.as_str()
        } else {
            remote.name.as_str()
        };
        let row = {
            let _name = self
                .locks
                .acquire(ctx, pass.kind.keyword(), NAME_LOCK_KEY, LockLevel::name(pass.depth))
                .await?;
            row.name = generate_name(
                self.store.as_ref(),
                pass.kind,
                &row.owner.domain_id,
                base,
                &self.config.name_policy(),
            )
            .await?;
            self.store.insert(row).await?
        };

        self.events.emit(Event::SyncCreate {
            kind: pass.kind,
            id: row.id.clone(),
            external_id: remote.global_id.clone(),
        });
        self.audit
            .sync_created(pass.kind, &row.id, &row.name, &remote.global_id);
        Ok(row)
    }
}

#[async_trait]
impl Reconciler for ResourceReconciler {
    async fn reconcile(
        &self,
        ctx: &SyncContext,
        kind: ResourceKind,
        scope: &Scope,
        opts: &ReconcileOptions,
    ) -> SyncResult {
        let mut result = SyncResult::new(kind);
        let depth = self.depth(kind);
        let scope_key = scope.key();

        let _scope = match self
            .locks
            .acquire(ctx, kind.lock_class(), &scope_key, LockLevel::scope(depth))
            .await
        {
            Ok(guard) => guard,
            Err(e) => {
                let err = SyncError::from(e);
                warn!(kind = %kind, scope = %scope_key, error = %err, "Failed to lock scope");
                result.abort(Phase::Open, &err);
                return result;
            }
        };

        let driver = match self.registry.lookup(scope.provider.kind, kind) {
            Ok(driver) => driver,
            Err(e) => {
                result.abort(Phase::Open, &e.into());
                return result;
            }
        };

        let started = Instant::now();
        let locals = match self.store.list_by_scope(kind, &scope.filter()).await {
            Ok(rows) => rows,
            Err(e) => {
                result.abort(Phase::Open, &e.into());
                return result;
            }
        };
        result.store_cost = started.elapsed();

        let upstream = scope.upstream();
        let pass = Pass {
            kind,
            depth,
            provider: &scope.provider,
            upstream: &upstream,
            driver: Arc::clone(&driver),
            parent: None,
            opts,
        };

        if scope.is_on_premise() {
            // Locally managed rows never meet an upstream list; only sweep
            // leftovers of earlier deletes.
            for row in locals
                .iter()
                .filter(|r| r.deletion == DeletionState::Tombstoned)
            {
                if let Err(e) = self.lifecycle.real_delete(ctx, row).await {
                    result.record(Phase::Delete, Some(row.id.as_str()), &e);
                }
            }
            return result;
        }

        if !driver.supports(Capability::ListUpstream) {
            result.abort(
                Phase::Open,
                &SyncError::Driver(DriverError::NotSupported(Capability::ListUpstream)),
            );
            return result;
        }

        if let (Some(region), true) = (&scope.region, driver.supports(Capability::GetRegionHandle)) {
            match ctx.run(driver.region_handle(ctx, region)).await {
                Ok(Ok(handle)) => {
                    debug!(region = %handle.external_id, endpoint = ?handle.endpoint, "Region resolved")
                }
                Ok(Err(e)) => {
                    let err = SyncError::from(e);
                    warn!(kind = %kind, scope = %scope_key, error = %err, "Failed to resolve region");
                    result.abort(Phase::Open, &err);
                    return result;
                }
                Err(cancelled) => {
                    result.record(Phase::Open, None, &cancelled.into());
                    return result;
                }
            }
        }

        let started = Instant::now();
        let remotes = match ctx.run(driver.list_upstream(ctx, kind, &upstream)).await {
            Ok(Ok(remotes)) => remotes,
            Ok(Err(e)) => {
                let err = SyncError::from(e);
                match err.issue_kind() {
                    IssueKind::Permanent => {
                        error!(kind = %kind, scope = %scope_key, error = %err, "Provider rejected listing")
                    }
                    _ => warn!(kind = %kind, scope = %scope_key, error = %err, "Failed to list upstream"),
                }
                result.request_cost = started.elapsed();
                result.abort(Phase::Open, &err);
                return result;
            }
            Err(cancelled) => {
                result.record(Phase::Open, None, &cancelled.into());
                return result;
            }
        };
        result.request_cost = started.elapsed();

        self.converge(ctx, &pass, locals, remotes, &mut result).await;

        if result.cancelled {
            info!(kind = %kind, scope = %scope_key, "Reconcile cancelled: {}", result.summary());
        } else {
            debug!(kind = %kind, scope = %scope_key, "Reconciled: {}", result.summary());
        }
        result
    }

    async fn finalize(&self, ctx: &SyncContext, id: &str) -> Result<()> {
        let row = self.store.get(id).await?;
        self.lifecycle.real_delete(ctx, &row).await?;
        Ok(())
    }
}
