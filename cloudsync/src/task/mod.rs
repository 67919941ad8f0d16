//! Lifecycle tasks and the runtime that executes them.
//!
//! Provider-affecting work is never done inline: the lifecycle dispatcher
//! queues a typed [`LifecycleTask`] and the runtime hands it to a
//! [`TaskHandler`]. Queued tasks outlive the context that queued them.

pub mod executor;
pub mod runtime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{CredentialHandle, ResourceKind};

pub use executor::LifecycleExecutor;
pub use runtime::{LocalTaskRuntime, TaskHandler, TaskRuntime};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task {0} already finished")]
    AlreadyFinished(String),

    #[error("failed to enqueue task: {0}")]
    Enqueue(String),
}

pub type Result<T> = std::result::Result<T, TaskError>;

/// Typed payload of a lifecycle task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleTask {
    Create,
    Delete {
        /// Skip the provider call and only drop the local mirror.
        purge: bool,
    },
    SyncStatus,
    RemoteUpdate {
        replace_tags: bool,
    },
}

impl LifecycleTask {
    /// Well-known task name, e.g. `WafDeleteTask`.
    pub fn task_name(&self, kind: ResourceKind) -> String {
        let suffix = match self {
            LifecycleTask::Create => "CreateTask",
            LifecycleTask::Delete { .. } => "DeleteTask",
            LifecycleTask::SyncStatus => "SyncstatusTask",
            LifecycleTask::RemoteUpdate { .. } => "RemoteUpdateTask",
        };
        format!("{}{}", kind.task_prefix(), suffix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_open(self) -> bool {
        matches!(self, TaskState::Queued | TaskState::Running)
    }
}

/// What a caller asks the runtime to create.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub kind: ResourceKind,
    pub object_id: String,
    pub credential: CredentialHandle,
    pub payload: LifecycleTask,
    pub parent_task_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub kind: ResourceKind,
    pub object_id: String,
    pub credential: CredentialHandle,
    pub payload: LifecycleTask,
    pub parent_task_id: Option<String>,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Task {
    pub fn from_spec(spec: TaskSpec) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: spec.payload.task_name(spec.kind),
            kind: spec.kind,
            object_id: spec.object_id,
            credential: spec.credential,
            payload: spec.payload,
            parent_task_id: spec.parent_task_id,
            state: TaskState::Queued,
            created_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }
}
