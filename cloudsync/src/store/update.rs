//! Read-modify-write of a single row under its row lock.

use tracing::debug;

use super::error::StoreError;
use super::traits::ResourceStore;
use crate::context::SyncContext;
use crate::error::Result;
use crate::lockman::{LockLevel, LockManager};
use crate::model::{Resource, ResourceKind};

const MAX_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    Updated {
        row: Resource,
        fields: Vec<&'static str>,
    },
    Unchanged(Resource),
}

impl UpdateOutcome {
    pub fn row(&self) -> &Resource {
        match self {
            UpdateOutcome::Updated { row, .. } | UpdateOutcome::Unchanged(row) => row,
        }
    }

    pub fn changed(&self) -> bool {
        matches!(self, UpdateOutcome::Updated { .. })
    }
}

/// Take the `(kind, id)` row lock, read row `id`, apply `mutate` and write it
/// back if `mutate` reported changed fields. A concurrent writer that bumps
/// the version makes the write retry from a fresh read.
pub async fn update_with_lock<F>(
    store: &dyn ResourceStore,
    locks: &LockManager,
    ctx: &SyncContext,
    kind: ResourceKind,
    depth: u32,
    id: &str,
    mut mutate: F,
) -> Result<UpdateOutcome>
where
    F: FnMut(&mut Resource) -> Vec<&'static str> + Send,
{
    let _row = locks
        .acquire(ctx, kind.keyword(), id, LockLevel::row(depth))
        .await?;

    let mut row = store.get(id).await?;
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut next = row.clone();
        let fields = mutate(&mut next);
        if fields.is_empty() {
            return Ok(UpdateOutcome::Unchanged(row));
        }
        match store.update(next).await {
            Ok(row) => return Ok(UpdateOutcome::Updated { row, fields }),
            Err(StoreError::VersionMismatch { expected, actual }) if attempt < MAX_ATTEMPTS => {
                debug!(id, expected, actual, attempt, "Row changed underneath, retrying");
                row = store.get(id).await?;
            }
            Err(e) => return Err(e.into()),
        }
    }
}
