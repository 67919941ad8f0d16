//! Resource status taxonomy.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Externally observable status of a mirrored resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Creating,
    Available,
    #[serde(alias = "sync_status_in_progress")]
    Syncing,
    UpdateTags,
    Deleting,
    DeleteFailed,
    CreateFailed,
    Unknown,
    #[serde(alias = "soldout")]
    SoldOut,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Creating => "creating",
            Status::Available => "available",
            Status::Syncing => "syncing",
            Status::UpdateTags => "update_tags",
            Status::Deleting => "deleting",
            Status::DeleteFailed => "delete_failed",
            Status::CreateFailed => "create_failed",
            Status::Unknown => "unknown",
            Status::SoldOut => "sold_out",
        }
    }

    /// A task owns the row while it is in one of these.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Status::Creating | Status::Deleting | Status::UpdateTags | Status::Syncing
        )
    }

    /// `*_failed` statuses, which the engine never silently restores.
    pub fn is_failed(self) -> bool {
        matches!(self, Status::DeleteFailed | Status::CreateFailed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid status: {0}")]
pub struct InvalidStatus(pub String);

impl FromStr for Status {
    type Err = InvalidStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Status::Creating),
            "available" => Ok(Status::Available),
            "syncing" | "sync_status_in_progress" => Ok(Status::Syncing),
            "update_tags" => Ok(Status::UpdateTags),
            "deleting" => Ok(Status::Deleting),
            "delete_failed" => Ok(Status::DeleteFailed),
            "create_failed" => Ok(Status::CreateFailed),
            "unknown" => Ok(Status::Unknown),
            "sold_out" | "soldout" => Ok(Status::SoldOut),
            other => Err(InvalidStatus(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("soldout".parse::<Status>().unwrap(), Status::SoldOut);
        assert_eq!("sold_out".parse::<Status>().unwrap(), Status::SoldOut);
        assert_eq!(
            "sync_status_in_progress".parse::<Status>().unwrap(),
            Status::Syncing
        );
    }

    #[test]
    fn test_rejects_unknown_status() {
        let err = "running".parse::<Status>().unwrap_err();
        assert_eq!(err, InvalidStatus("running".to_string()));
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&Status::DeleteFailed).unwrap();
        assert_eq!(json, "\"delete_failed\"");
        let parsed: Status = serde_json::from_str("\"soldout\"").unwrap();
        assert_eq!(parsed, Status::SoldOut);
    }

    #[test]
    fn test_transient_set() {
        assert!(Status::Creating.is_transient());
        assert!(Status::Syncing.is_transient());
        assert!(!Status::Available.is_transient());
        assert!(!Status::DeleteFailed.is_transient());
    }
}
