//! Providers and regions. Both are owned elsewhere; the engine only reads them.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Aws,
    Aliyun,
    Huawei,
    Qcloud,
    Azure,
    Google,
    /// Synthetic provider for locally-managed resources.
    OnPremise,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Aws => "aws",
            ProviderKind::Aliyun => "aliyun",
            ProviderKind::Huawei => "huawei",
            ProviderKind::Qcloud => "qcloud",
            ProviderKind::Azure => "azure",
            ProviderKind::Google => "google",
            ProviderKind::OnPremise => "on_premise",
        }
    }

    pub fn is_on_premise(self) -> bool {
        self == ProviderKind::OnPremise
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque reference to provider credentials. Drivers resolve it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialHandle(pub String);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Normal,
    Insufficient,
    Suspended,
    Arrears,
    Unknown,
}

/// Assigns new mirrors to a project when all of `tags` match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMappingRule {
    pub tags: BTreeMap<String, String>,
    pub domain_id: Option<String>,
    pub project_id: String,
}

impl ProjectMappingRule {
    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        !self.tags.is_empty() && self.tags.iter().all(|(k, v)| tags.get(k) == Some(v))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub kind: ProviderKind,
    #[serde(default)]
    pub credential: CredentialHandle,
    #[serde(default)]
    pub health: HealthStatus,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub domain_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub project_mappings: Vec<ProjectMappingRule>,
    /// Upstream project id to local project id.
    #[serde(default)]
    pub external_projects: BTreeMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

impl Provider {
    pub fn new(id: &str, kind: ProviderKind, domain_id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            kind,
            credential: CredentialHandle::default(),
            health: HealthStatus::Normal,
            read_only: false,
            enabled: true,
            domain_id: domain_id.to_string(),
            project_id: None,
            project_mappings: Vec::new(),
            external_projects: BTreeMap::new(),
        }
    }

    pub fn on_premise(domain_id: &str) -> Self {
        Self::new("on-premise", ProviderKind::OnPremise, domain_id)
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Only healthy, enabled providers are synced.
    pub fn is_syncable(&self) -> bool {
        self.enabled
            && matches!(
                self.health,
                HealthStatus::Normal | HealthStatus::Insufficient
            )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    pub external_id: String,
    pub provider_kind: ProviderKind,
    #[serde(default)]
    pub on_premise: bool,
}

impl Region {
    pub fn new(id: &str, external_id: &str, provider_kind: ProviderKind) -> Self {
        Self {
            id: id.to_string(),
            external_id: external_id.to_string(),
            provider_kind,
            on_premise: provider_kind.is_on_premise(),
        }
    }
}

/// Sync state of a provider as seen by the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderSyncStatus {
    #[default]
    Idle,
    Queued,
    Syncing,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSyncState {
    pub status: ProviderSyncStatus,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_sync_end_at: Option<DateTime<Utc>>,
    pub last_note: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_rule_requires_all_tags() {
        let rule = ProjectMappingRule {
            tags: BTreeMap::from([
                ("team".to_string(), "db".to_string()),
                ("env".to_string(), "prod".to_string()),
            ]),
            domain_id: None,
            project_id: "proj-db".into(),
        };
        let mut tags = BTreeMap::from([("team".to_string(), "db".to_string())]);
        assert!(!rule.matches(&tags));
        tags.insert("env".into(), "prod".into());
        assert!(rule.matches(&tags));
        assert!(!ProjectMappingRule::default().matches(&tags));
    }

    #[test]
    fn test_syncable() {
        let mut p = Provider::new("p1", ProviderKind::Aws, "d1");
        assert!(p.is_syncable());
        p.health = HealthStatus::Suspended;
        assert!(!p.is_syncable());
    }
}
