//! Events emitted by the engine.

use tokio::sync::broadcast;
use tracing::trace;

use crate::model::{ResourceKind, Status};

/// Fire-and-forget notifications keyed by object.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A mirror row was created from an upstream object.
    SyncCreate {
        kind: ResourceKind,
        id: String,
        external_id: String,
    },
    /// Mirrored fields of a row changed.
    SyncUpdate {
        kind: ResourceKind,
        id: String,
        fields: Vec<String>,
    },
    /// A mirror row was removed.
    SyncDelete {
        kind: ResourceKind,
        id: String,
        external_id: Option<String>,
    },
    /// Lifecycle status transition.
    StatusChanged {
        kind: ResourceKind,
        id: String,
        from: Status,
        to: Status,
        reason: Option<String>,
    },
    /// A lifecycle task was queued for the object.
    TaskScheduled {
        task_id: String,
        name: String,
        object_id: String,
    },
}

impl Event {
    pub fn object_id(&self) -> &str {
        match self {
            Event::SyncCreate { id, .. }
            | Event::SyncUpdate { id, .. }
            | Event::SyncDelete { id, .. }
            | Event::StatusChanged { id, .. } => id,
            Event::TaskScheduled { object_id, .. } => object_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::SyncCreate { .. } => "sync_create",
            Event::SyncUpdate { .. } => "sync_update",
            Event::SyncDelete { .. } => "sync_delete",
            Event::StatusChanged { .. } => "status_changed",
            Event::TaskScheduled { .. } => "task_scheduled",
        }
    }
}

/// Broadcast channel for engine events. Emitting never blocks or fails.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: Event) {
        trace!(event = event.name(), object = event.object_id(), "Emitting event");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
