//! Project and domain assignment for new mirrors.

use async_trait::async_trait;
use tracing::debug;

use crate::context::SyncContext;
use crate::model::{OwnerInfo, Provider, RemoteResource, Resource};

/// Decides who owns a freshly created mirror. Only consulted on create;
/// afterwards the local assignment wins.
#[async_trait]
pub trait ProjectResolver: Send + Sync {
    async fn sync_cloud_project(
        &self,
        ctx: &SyncContext,
        obj: &mut Resource,
        sync_owner: Option<&OwnerInfo>,
        ext: &RemoteResource,
        provider: &Provider,
    );
}

/// Resolution order: a tag-matching mapping rule of the provider, the
/// upstream project mapping, the caller's sync owner, then the provider's
/// own domain and project.
#[derive(Debug, Default, Clone, Copy)]
pub struct MappingProjectResolver;

impl MappingProjectResolver {
    fn resolve(
        sync_owner: Option<&OwnerInfo>,
        ext: &RemoteResource,
        provider: &Provider,
    ) -> (OwnerInfo, &'static str) {
        if let Some(rule) = provider.project_mappings.iter().find(|r| r.matches(&ext.tags)) {
            let owner = OwnerInfo {
                domain_id: rule
                    .domain_id
                    .clone()
                    .unwrap_or_else(|| provider.domain_id.clone()),
                project_id: Some(rule.project_id.clone()),
            };
            return (owner, "mapping_rule");
        }
        let mapped = ext
            .project_id
            .as_ref()
            .and_then(|p| provider.external_projects.get(p));
        if let Some(project_id) = mapped {
            let owner = OwnerInfo {
                domain_id: provider.domain_id.clone(),
                project_id: Some(project_id.clone()),
            };
            return (owner, "external_project");
        }
        if let Some(owner) = sync_owner {
            return (owner.clone(), "sync_owner");
        }
        let owner = OwnerInfo {
            domain_id: provider.domain_id.clone(),
            project_id: provider.project_id.clone(),
        };
        (owner, "provider")
    }
}

#[async_trait]
impl ProjectResolver for MappingProjectResolver {
    async fn sync_cloud_project(
        &self,
        ctx: &SyncContext,
        obj: &mut Resource,
        sync_owner: Option<&OwnerInfo>,
        ext: &RemoteResource,
        provider: &Provider,
    ) {
        let (owner, source) = Self::resolve(sync_owner, ext, provider);
        debug!(
            external_id = %ext.global_id,
            domain = %owner.domain_id,
            project = ?owner.project_id,
            source,
            trace_id = %ctx.trace_id(),
            "Assigned project"
        );
        obj.owner = owner;
    }
}
