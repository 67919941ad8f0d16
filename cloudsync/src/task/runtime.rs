//! Task runtime contract and the in-process implementation.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::{Result, Task, TaskError, TaskSpec, TaskState};

/// Executes one task. An `Err` marks the task failed with that message.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, task: Task) -> std::result::Result<(), String>;
}

#[async_trait]
pub trait TaskRuntime: Send + Sync {
    async fn new_task(&self, spec: TaskSpec) -> Result<Task>;

    /// Start the task in the background.
    async fn schedule_run(&self, task_id: &str) -> Result<()>;

    /// Tasks of `object_id` created at or after `since`.
    async fn query_tasks_of_object(
        &self,
        object_id: &str,
        since: DateTime<Utc>,
        open_only: bool,
    ) -> Result<usize>;

    async fn get(&self, task_id: &str) -> Result<Task>;
}

const FINISHED_CAPACITY: usize = 1024;

struct RuntimeInner {
    open: Mutex<HashMap<String, Task>>,
    finished: Mutex<LruCache<String, Task>>,
    handler: OnceLock<Arc<dyn TaskHandler>>,
    autorun: bool,
    running: AtomicUsize,
    idle: Notify,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl RuntimeInner {
    async fn run(self: Arc<Self>, task_id: String) {
        let task = {
            let mut open = lock(&self.open);
            match open.get_mut(&task_id) {
                Some(task) if task.state == TaskState::Queued => {
                    task.state = TaskState::Running;
                    task.clone()
                }
                _ => return,
            }
        };
        let Some(handler) = self.handler.get().cloned() else {
            warn!(task = %task.name, task_id = %task.id, "No task handler installed");
            return;
        };

        debug!(task = %task.name, task_id = %task.id, object = %task.object_id, "Running task");
        let outcome = handler.run(task).await;

        let Some(mut task) = lock(&self.open).remove(&task_id) else {
            return;
        };
        task.finished_at = Some(Utc::now());
        match outcome {
            Ok(()) => {
                task.state = TaskState::Succeeded;
                info!(task = %task.name, task_id = %task.id, "Task succeeded");
            }
            Err(e) => {
                task.state = TaskState::Failed;
                warn!(task = %task.name, task_id = %task.id, error = %e, "Task failed");
                task.error = Some(e);
            }
        }
        lock(&self.finished).put(task_id, task);
    }
}

/// In-memory task table. Each scheduled run is a tokio task; finished
/// tasks are kept in a bounded LRU for lookups.
#[derive(Clone)]
pub struct LocalTaskRuntime {
    inner: Arc<RuntimeInner>,
}

impl LocalTaskRuntime {
    pub fn new() -> Self {
        Self::build(true)
    }

    /// Tasks stay queued until [`LocalTaskRuntime::run_now`] is called.
    pub fn manual() -> Self {
        Self::build(false)
    }

    fn build(autorun: bool) -> Self {
        let capacity = NonZeroUsize::new(FINISHED_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(RuntimeInner {
                open: Mutex::new(HashMap::new()),
                finished: Mutex::new(LruCache::new(capacity)),
                handler: OnceLock::new(),
                autorun,
                running: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Install the handler. Only the first call has an effect.
    pub fn set_handler(&self, handler: Arc<dyn TaskHandler>) {
        if self.inner.handler.set(handler).is_err() {
            warn!("Task handler already installed");
        }
    }

    /// Run a queued task to completion on the current task.
    pub async fn run_now(&self, task_id: &str) -> Result<Task> {
        Arc::clone(&self.inner).run(task_id.to_string()).await;
        self.get(task_id).await
    }

    /// Ids of tasks that have not finished yet.
    pub fn open_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<_> = lock(&self.inner.open).values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Wait until every spawned run has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.running.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for LocalTaskRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskRuntime for LocalTaskRuntime {
    async fn new_task(&self, spec: TaskSpec) -> Result<Task> {
        let task = Task::from_spec(spec);
        lock(&self.inner.open).insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn schedule_run(&self, task_id: &str) -> Result<()> {
        {
            let open = lock(&self.inner.open);
            match open.get(task_id) {
                Some(task) if task.state == TaskState::Queued => {}
                Some(_) => return Err(TaskError::AlreadyFinished(task_id.to_string())),
                None => {
                    return if lock(&self.inner.finished).contains(task_id) {
                        Err(TaskError::AlreadyFinished(task_id.to_string()))
                    } else {
                        Err(TaskError::NotFound(task_id.to_string()))
                    };
                }
            }
        }
        if !self.inner.autorun {
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        let task_id = task_id.to_string();
        inner.running.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            Arc::clone(&inner).run(task_id).await;
            if inner.running.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.idle.notify_waiters();
            }
        });
        Ok(())
    }

    async fn query_tasks_of_object(
        &self,
        object_id: &str,
        since: DateTime<Utc>,
        open_only: bool,
    ) -> Result<usize> {
        let matches = |t: &Task| t.object_id == object_id && t.created_at >= since;
        let mut count = lock(&self.inner.open).values().filter(|t| matches(t)).count();
        if !open_only {
            count += lock(&self.inner.finished)
                .iter()
                .filter(|(_, t)| matches(t))
                .count();
        }
        Ok(count)
    }

    async fn get(&self, task_id: &str) -> Result<Task> {
        if let Some(task) = lock(&self.inner.open).get(task_id) {
            return Ok(task.clone());
        }
        lock(&self.inner.finished)
            .peek(task_id)
            .cloned()
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CredentialHandle, ResourceKind};
    use crate::task::LifecycleTask;

    struct Flaky;

    #[async_trait]
    impl TaskHandler for Flaky {
        async fn run(&self, task: Task) -> std::result::Result<(), String> {
            match task.payload {
                LifecycleTask::Create => Ok(()),
                _ => Err("provider said no".to_string()),
            }
        }
    }

    fn spec(object_id: &str, payload: LifecycleTask) -> TaskSpec {
        TaskSpec {
            kind: ResourceKind::WafInstance,
            object_id: object_id.to_string(),
            credential: CredentialHandle::default(),
            payload,
            parent_task_id: None,
        }
    }

    #[tokio::test]
    async fn test_spawned_tasks_finish() {
        let rt = LocalTaskRuntime::new();
        rt.set_handler(Arc::new(Flaky));
        let ok = rt.new_task(spec("w-1", LifecycleTask::Create)).await.unwrap();
        let bad = rt
            .new_task(spec("w-1", LifecycleTask::Delete { purge: false }))
            .await
            .unwrap();
        rt.schedule_run(&ok.id).await.unwrap();
        rt.schedule_run(&bad.id).await.unwrap();
        rt.wait_idle().await;

        assert_eq!(rt.get(&ok.id).await.unwrap().state, TaskState::Succeeded);
        let bad = rt.get(&bad.id).await.unwrap();
        assert_eq!(bad.state, TaskState::Failed);
        assert_eq!(bad.name, "WafDeleteTask");
        assert_eq!(bad.error.as_deref(), Some("provider said no"));
        assert!(matches!(
            rt.schedule_run(&bad.id).await,
            Err(TaskError::AlreadyFinished(_))
        ));
    }

    #[tokio::test]
    async fn test_query_open_tasks() {
        let rt = LocalTaskRuntime::manual();
        rt.set_handler(Arc::new(Flaky));
        let since = Utc::now() - chrono::Duration::minutes(3);
        let t = rt.new_task(spec("w-1", LifecycleTask::SyncStatus)).await.unwrap();
        rt.schedule_run(&t.id).await.unwrap();
        assert_eq!(rt.query_tasks_of_object("w-1", since, true).await.unwrap(), 1);
        assert_eq!(rt.query_tasks_of_object("w-2", since, true).await.unwrap(), 0);

        rt.run_now(&t.id).await.unwrap();
        assert_eq!(rt.query_tasks_of_object("w-1", since, true).await.unwrap(), 0);
        assert_eq!(rt.query_tasks_of_object("w-1", since, false).await.unwrap(), 1);
    }
}
