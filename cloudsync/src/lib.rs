//! cloudsync - mirrors upstream cloud provider inventories into a local
//! resource store.

pub mod audit;
pub mod compare;
pub mod config;
pub mod context;
pub mod driver;
pub mod engine;
pub mod error;
pub mod identity;
pub mod inventory;
pub mod lifecycle;
pub mod lockman;
pub mod metadata;
pub mod model;
pub mod naming;
pub mod reconciler;
pub mod scheduler;
pub mod store;
pub mod task;

pub use audit::SyncAuditLogger;
pub use config::EngineConfig;
pub use context::SyncContext;
pub use engine::{Engine, EngineBuilder};
pub use error::{IssueKind, SyncError};
pub use lifecycle::{Lifecycle, LifecycleError};
pub use lockman::{LockError, LockManager};
pub use reconciler::{ReconcileOptions, Reconciler, Scope, SyncResult, SyncResultSet};
pub use scheduler::{SyncRange, SyncScheduler};
pub use store::{Event, MemoryStore, ResourceStore, StoreError};
