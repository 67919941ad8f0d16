//! Domain model shared by every engine component.

pub mod kind;
pub mod provider;
pub mod resource;
pub mod status;

pub use kind::{ParseKindError, ResourceKind, Scoping};
pub use provider::{
    CredentialHandle, HealthStatus, ProjectMappingRule, Provider, ProviderKind,
    ProviderSyncState, ProviderSyncStatus, Region,
};
pub use resource::{
    DeletionState, InvalidTransition, Managed, ManagedInfo, Owned, OwnerInfo, Regional,
    RegionInfo, RemoteResource, Resource,
};
pub use status::{InvalidStatus, Status};
