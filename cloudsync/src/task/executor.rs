//! Runs lifecycle tasks against the provider drivers.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{debug, error};

use super::runtime::TaskHandler;
use super::{LifecycleTask, Task};
use crate::context::SyncContext;
use crate::driver::DriverError;
use crate::lifecycle::Lifecycle;
use crate::model::{Managed, RemoteResource};

/// Task handler backed by a [`Lifecycle`]. Holds it weakly: the lifecycle
/// owns the runtime that owns this handler.
pub struct LifecycleExecutor {
    lifecycle: Weak<Lifecycle>,
}

impl LifecycleExecutor {
    pub fn new(lifecycle: &Arc<Lifecycle>) -> Self {
        Self {
            lifecycle: Arc::downgrade(lifecycle),
        }
    }

    async fn call_provider(
        lifecycle: &Lifecycle,
        ctx: &SyncContext,
        task: &Task,
    ) -> Result<Option<RemoteResource>, String> {
        let row = lifecycle
            .store()
            .get(&task.object_id)
            .await
            .map_err(|e| e.to_string())?;
        let Some(upstream) = lifecycle.upstream_of(&row).map_err(|e| e.to_string())? else {
            // Nothing upstream to talk to; settle locally.
            return Ok(None);
        };
        let mutating = !matches!(
            task.payload,
            LifecycleTask::SyncStatus | LifecycleTask::Delete { purge: true }
        );
        if mutating && upstream.provider.read_only {
            return Err(format!("provider {} is read-only", upstream.provider.id));
        }

        let driver = upstream.driver;
        let scope = upstream.scope;
        let kind = task.kind;
        let result = match (&task.payload, row.external_id()) {
            (LifecycleTask::Create, _) => driver.create(ctx, kind, &scope, &row).await.map(Some),
            (LifecycleTask::Delete { purge: true }, _) | (LifecycleTask::Delete { .. }, None) => {
                Ok(None)
            }
            (LifecycleTask::Delete { .. }, Some(ext)) => {
                match driver.delete(ctx, kind, &scope, ext).await {
                    // Already gone upstream.
                    Ok(()) | Err(DriverError::NotFound(_)) => Ok(None),
                    Err(e) => Err(e),
                }
            }
            (LifecycleTask::SyncStatus, Some(ext)) => {
                driver.get_one(ctx, kind, &scope, ext).await.map(Some)
            }
            (LifecycleTask::RemoteUpdate { replace_tags }, Some(ext)) => driver
                .update_tags(ctx, kind, &scope, ext, &row.tags, *replace_tags)
                .await
                .map(|_| None),
            (LifecycleTask::SyncStatus | LifecycleTask::RemoteUpdate { .. }, None) => {
                return Err(format!("{} has no external id", row.id));
            }
        };
        result.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl TaskHandler for LifecycleExecutor {
    async fn run(&self, task: Task) -> Result<(), String> {
        let Some(lifecycle) = self.lifecycle.upgrade() else {
            return Err("lifecycle is gone".to_string());
        };
        let ctx = SyncContext::background(&format!("task:{}", task.name));
        debug!(task = %task.name, task_id = %task.id, "Calling provider");

        let outcome = Self::call_provider(&lifecycle, &ctx, &task).await;
        if let Err(e) = lifecycle.finish_task(&ctx, &task, outcome.clone()).await {
            error!(task = %task.name, task_id = %task.id, error = %e, "Failed to settle task");
            return Err(e.to_string());
        }
        outcome.map(|_| ())
    }
}
