//! Engine-level error type and its classification.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::Cancelled;
use crate::driver::{DriverError, RegistryError};
use crate::inventory::InventoryError;
use crate::lifecycle::LifecycleError;
use crate::lockman::LockError;
use crate::store::StoreError;
use crate::task::TaskError;

/// How an error is reported in a sync result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Network blip or throttling; retry later.
    Transient,
    /// Provider rejected the request; needs an operator.
    Permanent,
    /// A delete condition refused the delete.
    Validation,
    /// Duplicate id, child without parent, missing global id.
    Invariant,
    Cancelled,
    NotSupported,
    /// Local persistence failed.
    Store,
    /// Scope could not be locked.
    Lock,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error("no free name for {base} after {attempts} attempts")]
    NameExhausted { base: String, attempts: usize },

    #[error("cancelled")]
    Cancelled,
}

impl From<Cancelled> for SyncError {
    fn from(_: Cancelled) -> Self {
        SyncError::Cancelled
    }
}

impl SyncError {
    pub fn issue_kind(&self) -> IssueKind {
        match self {
            SyncError::Store(StoreError::Conflict(_)) => IssueKind::Invariant,
            SyncError::Store(_) => IssueKind::Store,
            SyncError::Lock(LockError::Cancelled { .. }) => IssueKind::Cancelled,
            SyncError::Lock(_) => IssueKind::Lock,
            SyncError::Driver(e) => driver_issue(e),
            SyncError::Registry(RegistryError::NoDriver { .. }) => IssueKind::NotSupported,
            SyncError::Registry(RegistryError::Cycle { .. }) => IssueKind::Invariant,
            SyncError::Task(_) => IssueKind::Permanent,
            SyncError::Lifecycle(e) => e.issue_kind(),
            SyncError::Inventory(_) => IssueKind::Invariant,
            SyncError::NameExhausted { .. } => IssueKind::Invariant,
            SyncError::Cancelled => IssueKind::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.issue_kind() == IssueKind::Cancelled
    }
}

pub(crate) fn driver_issue(e: &DriverError) -> IssueKind {
    match e {
        DriverError::Transient(_) => IssueKind::Transient,
        DriverError::Permanent(_) | DriverError::NotFound(_) => IssueKind::Permanent,
        DriverError::NotSupported(_) => IssueKind::NotSupported,
        DriverError::Cancelled => IssueKind::Cancelled,
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
