//! No-op driver for the synthetic on-premise provider.

use async_trait::async_trait;

use super::{Capability, Driver, Result, UpstreamScope};
use crate::context::SyncContext;
use crate::model::{RemoteResource, ResourceKind};

/// Reports an empty upstream and refuses every mutation, so locally-managed
/// resources go through the same reconcile path as cloud ones.
#[derive(Debug, Default, Clone, Copy)]
pub struct OnPremDriver;

#[async_trait]
impl Driver for OnPremDriver {
    fn name(&self) -> &str {
        "on_premise"
    }

    fn supports(&self, cap: Capability) -> bool {
        matches!(cap, Capability::ListUpstream | Capability::ListChildren)
    }

    fn is_read_only(&self) -> bool {
        true
    }

    async fn list_upstream(
        &self,
        _ctx: &SyncContext,
        _kind: ResourceKind,
        _scope: &UpstreamScope,
    ) -> Result<Vec<RemoteResource>> {
        Ok(Vec::new())
    }

    async fn list_children(
        &self,
        _ctx: &SyncContext,
        _scope: &UpstreamScope,
        _parent: &RemoteResource,
        _child_kind: ResourceKind,
    ) -> Result<Vec<RemoteResource>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverError;
    use crate::model::{CredentialHandle, Resource};

    #[tokio::test]
    async fn test_onprem_refuses_mutations() {
        let ctx = SyncContext::background("test");
        let scope = UpstreamScope {
            provider_id: "on-premise".into(),
            credential: CredentialHandle::default(),
            region: None,
        };
        let d = OnPremDriver;
        assert!(d.list_upstream(&ctx, ResourceKind::Disk, &scope).await.unwrap().is_empty());
        let spec = Resource::new(ResourceKind::Disk, "d");
        assert_eq!(
            d.create(&ctx, ResourceKind::Disk, &scope, &spec).await.unwrap_err(),
            DriverError::NotSupported(Capability::Create)
        );
        assert_eq!(
            d.delete(&ctx, ResourceKind::Disk, &scope, "x").await.unwrap_err(),
            DriverError::NotSupported(Capability::Delete)
        );
        assert!(!d.supports(Capability::UpdateTags));
    }
}
