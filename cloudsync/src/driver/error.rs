//! Driver error types.

use thiserror::Error;

use super::Capability;
use crate::model::{ProviderKind, ResourceKind};

/// Errors returned by provider drivers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    /// Network blip or throttling. Safe to retry later.
    #[error("transient: {0}")]
    Transient(String),

    /// Rejected by the provider (bad credentials, 4xx). Not retried.
    #[error("permanent: {0}")]
    Permanent(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("capability not supported: {0:?}")]
    NotSupported(Capability),

    #[error("cancelled")]
    Cancelled,
}

impl DriverError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors from the driver registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no driver for {kind} on {provider}")]
    NoDriver {
        provider: ProviderKind,
        kind: ResourceKind,
    },

    #[error("edge {parent} -> {child} closes a cycle in the kind graph")]
    Cycle {
        parent: ResourceKind,
        child: ResourceKind,
    },
}
