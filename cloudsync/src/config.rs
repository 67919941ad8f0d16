//! Engine configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lockman::LockConfig;
use crate::naming::NamePolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Tunables shared by every engine component. Durations are in seconds so
/// the JSON form stays readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on concurrently running scope reconciles.
    pub workers: usize,
    /// `None` waits for a lock forever.
    pub lock_timeout_secs: Option<u64>,
    pub lock_warn_after_secs: u64,
    /// Rows with an open task younger than this are left alone.
    pub task_grace_period_secs: u64,
    /// Let upstream renames follow into the local name.
    pub enable_sync_name: bool,
    pub name_retry_limit: usize,
    pub name_suffix_len: usize,
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            lock_timeout_secs: Some(300),
            lock_warn_after_secs: 30,
            task_grace_period_secs: 180,
            enable_sync_name: false,
            name_retry_limit: 20,
            name_suffix_len: 6,
            event_buffer: 256,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn lock_config(&self) -> LockConfig {
        LockConfig {
            timeout: self.lock_timeout_secs.map(Duration::from_secs),
            warn_after: Duration::from_secs(self.lock_warn_after_secs.max(1)),
        }
    }

    pub fn name_policy(&self) -> NamePolicy {
        NamePolicy {
            retry_limit: self.name_retry_limit,
            suffix_len: self.name_suffix_len,
        }
    }

    pub fn task_grace_period(&self) -> Duration {
        Duration::from_secs(self.task_grace_period_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"workers": 2, "lock_timeout_secs": null}"#).unwrap();
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.lock_config().timeout, None);
        assert_eq!(cfg.task_grace_period(), Duration::from_secs(180));
        assert!(!cfg.enable_sync_name);
    }
}
