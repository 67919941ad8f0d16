//! Persistence layer for mirror rows.

pub mod error;
pub mod event;
pub mod memory;
pub mod traits;
pub mod update;

pub use error::StoreError;
pub use event::{Event, EventBus};
pub use memory::{MemoryStore, StoreOp};
pub use traits::{ResourceStore, ScopeFilter};
pub use update::{UpdateOutcome, update_with_lock};
