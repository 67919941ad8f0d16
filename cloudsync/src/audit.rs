//! Audit trail for mirror mutations, lifecycle transitions and operator actions.
//!
//! Records always go to tracing on the `audit` target. When a log file is
//! configured they are also appended there as JSON lines. Writing is
//! non-blocking and fault-tolerant: a failed append is logged and dropped.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::model::{ResourceKind, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Info,
    Audit,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub level: AuditLevel,
    pub component: String,
    pub message: String,
    pub object_ids: Vec<String>,
}

struct AuditSink {
    component: String,
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl AuditSink {
    fn trace(&self, level: AuditLevel, message: &str, object_ids: &[String]) {
        match level {
            AuditLevel::Error => {
                tracing::error!(target: "audit", component = %self.component, objects = ?object_ids, "{}", message)
            }
            AuditLevel::Warn => {
                tracing::warn!(target: "audit", component = %self.component, objects = ?object_ids, "{}", message)
            }
            AuditLevel::Audit | AuditLevel::Info => {
                tracing::info!(target: "audit", component = %self.component, objects = ?object_ids, "{}", message)
            }
        }
    }

    async fn append(&self, record: AuditRecord) {
        let Some(path) = &self.path else {
            return;
        };
        let mut line = match serde_json::to_vec(&record) {
            Ok(line) => line,
            Err(e) => {
                debug!(error = %e, "Failed to encode audit record");
                return;
            }
        };
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await;
        match file {
            Ok(mut f) => {
                if let Err(e) = f.write_all(&line).await {
                    debug!(error = %e, path = %path.display(), "Failed to append audit record");
                }
            }
            Err(e) => {
                debug!(error = %e, path = %path.display(), "Audit log unavailable");
            }
        }
    }
}

/// Audit logger for the sync engine.
#[derive(Clone)]
pub struct SyncAuditLogger {
    inner: Arc<AuditSink>,
}

impl SyncAuditLogger {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(AuditSink {
                component: "cloudsync".to_string(),
                path: Some(log_path.into()),
                write_lock: Mutex::new(()),
            }),
        }
    }

    /// Tracing only, nothing is written to disk.
    pub fn new_noop() -> Self {
        Self {
            inner: Arc::new(AuditSink {
                component: "cloudsync".to_string(),
                path: None,
                write_lock: Mutex::new(()),
            }),
        }
    }

    fn log_async(&self, level: AuditLevel, message: String, object_ids: Vec<String>) {
        self.inner.trace(level, &message, &object_ids);
        if self.inner.path.is_none() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let record = AuditRecord {
            timestamp: Utc::now(),
            level,
            component: inner.component.clone(),
            message,
            object_ids,
        };
        handle.spawn(async move {
            inner.append(record).await;
        });
    }

    // Mirror events
    pub fn sync_created(&self, kind: ResourceKind, id: &str, name: &str, external_id: &str) {
        self.log_async(
            AuditLevel::Audit,
            format!("Mirror created: {} {} ({}) for {}", kind, name, id, external_id),
            vec![id.to_string()],
        );
    }

    pub fn sync_updated(&self, kind: ResourceKind, id: &str, fields: &[&str]) {
        self.log_async(
            AuditLevel::Info,
            format!("Mirror updated: {} {} [{}]", kind, id, fields.join(",")),
            vec![id.to_string()],
        );
    }

    pub fn sync_deleted(&self, kind: ResourceKind, ids: &[String]) {
        self.log_async(
            AuditLevel::Audit,
            format!("Mirror deleted: {} x{}", kind, ids.len()),
            ids.to_vec(),
        );
    }

    pub fn delete_prevented(&self, kind: ResourceKind, id: &str, reason: &str) {
        self.log_async(
            AuditLevel::Warn,
            format!("Delete prevented: {} {}: {}", kind, id, reason),
            vec![id.to_string()],
        );
    }

    // Lifecycle events
    pub fn status_changed(
        &self,
        kind: ResourceKind,
        id: &str,
        from: Status,
        to: Status,
        reason: Option<&str>,
    ) {
        let level = if to.is_failed() {
            AuditLevel::Error
        } else {
            AuditLevel::Info
        };
        let message = match reason {
            Some(reason) => format!("Status {} {}: {} -> {} ({})", kind, id, from, to, reason),
            None => format!("Status {} {}: {} -> {}", kind, id, from, to),
        };
        self.log_async(level, message, vec![id.to_string()]);
    }

    pub fn task_dispatched(&self, task_name: &str, task_id: &str, object_id: &str) {
        self.log_async(
            AuditLevel::Audit,
            format!("Task dispatched: {} ({})", task_name, task_id),
            vec![task_id.to_string(), object_id.to_string()],
        );
    }

    pub fn task_finished(&self, task_name: &str, task_id: &str, error: Option<&str>) {
        match error {
            Some(e) => self.log_async(
                AuditLevel::Error,
                format!("Task failed: {} ({}): {}", task_name, task_id, e),
                vec![task_id.to_string()],
            ),
            None => self.log_async(
                AuditLevel::Info,
                format!("Task finished: {} ({})", task_name, task_id),
                vec![task_id.to_string()],
            ),
        }
    }

    // Operator events
    pub fn lock_force_released(&self, class: &str, key: &str, owner: u64) {
        self.log_async(
            AuditLevel::Warn,
            format!("Lock force released: {}/{} held by {}", class, key, owner),
            vec![format!("{}/{}", class, key)],
        );
    }

    pub fn provider_synced(&self, provider_id: &str, summary: &str) {
        self.log_async(
            AuditLevel::Info,
            format!("Provider synced: {}: {}", provider_id, summary),
            vec![provider_id.to_string()],
        );
    }
}

impl Default for SyncAuditLogger {
    fn default() -> Self {
        Self::new_noop()
    }
}
