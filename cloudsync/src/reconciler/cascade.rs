//! Child reconciles below a parent row.
//!
//! Children are listed locally by parent id and upstream through the
//! parent's driver, then run through the same converge pass as top-level
//! rows. The lock is `(child class, parent id)`, or
//! `(parent class, "<parent id>-records")` for record-style children.

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use super::{ChildSync, Pass, Phase, ResourceReconciler, SyncResult};
use crate::context::SyncContext;
use crate::driver::Capability;
use crate::error::SyncError;
use crate::lockman::LockLevel;
use crate::model::{RemoteResource, Resource, ResourceKind};
use crate::store::ScopeFilter;

impl ResourceReconciler {
    /// Reconcile every child kind of `pass.kind` below `parent`.
    pub(super) fn cascade<'a>(
        &'a self,
        ctx: &'a SyncContext,
        pass: &'a Pass<'a>,
        parent: &'a Resource,
        remote: &'a RemoteResource,
    ) -> BoxFuture<'a, Vec<ChildSync>> {
        async move {
            let mut out = Vec::new();
            for &child_kind in self.registry.graph().children_of(pass.kind) {
                if ctx.is_cancelled() {
                    break;
                }
                if let Some(result) = self
                    .sync_child_kind(ctx, pass, parent, remote, child_kind)
                    .await
                {
                    out.push(ChildSync {
                        parent_id: parent.id.clone(),
                        result,
                    });
                }
            }
            out
        }
        .boxed()
    }

    /// `None` when the parent's driver cannot list this child kind.
    pub(super) async fn sync_child_kind(
        &self,
        ctx: &SyncContext,
        pass: &Pass<'_>,
        parent: &Resource,
        remote_parent: &RemoteResource,
        child_kind: ResourceKind,
    ) -> Option<SyncResult> {
        if !pass.driver.supports(Capability::ListChildren) {
            return None;
        }
        let mut result = SyncResult::new(child_kind);
        let depth = self.depth(child_kind);

        let (class, key) = if child_kind.uses_records_lock() {
            (pass.kind.lock_class(), format!("{}-records", parent.id))
        } else {
            (child_kind.lock_class(), parent.id.clone())
        };
        let _scope = match self
            .locks
            .acquire(ctx, class, &key, LockLevel::scope(depth))
            .await
        {
            Ok(guard) => guard,
            Err(e) => {
                result.abort(Phase::Open, &e.into());
                return Some(result);
            }
        };

        let locals = match self
            .store
            .list_by_scope(child_kind, &ScopeFilter::Parent(parent.id.clone()))
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                result.abort(Phase::Open, &e.into());
                return Some(result);
            }
        };

        let started = std::time::Instant::now();
        let listed = ctx
            .run(
                pass.driver
                    .list_children(ctx, pass.upstream, remote_parent, child_kind),
            )
            .await;
        result.request_cost = started.elapsed();
        let remotes = match listed {
            Ok(Ok(remotes)) => remotes,
            Ok(Err(e)) => {
                let err = SyncError::from(e);
                warn!(kind = %child_kind, parent = %parent.id, error = %err, "Failed to list children");
                result.abort(Phase::Cascade, &err);
                return Some(result);
            }
            Err(cancelled) => {
                result.record(Phase::Cascade, Some(parent.id.as_str()), &cancelled.into());
                return Some(result);
            }
        };

        // Children without a driver of their own go through the parent's.
        let driver = self
            .registry
            .lookup(pass.provider.kind, child_kind)
            .unwrap_or_else(|_| pass.driver.clone());
        let child_pass = Pass {
            kind: child_kind,
            depth,
            provider: pass.provider,
            upstream: pass.upstream,
            driver,
            parent: Some(parent),
            opts: pass.opts,
        };
        self.converge(ctx, &child_pass, locals, remotes, &mut result)
            .await;
        debug!(kind = %child_kind, parent = %parent.id, "Children reconciled: {}", result.summary());
        Some(result)
    }
}
