//! Tag mirroring between upstream objects and local rows.
//!
//! Upstream tags always win. Tags a user set locally under the `user:`
//! prefix are kept and, unless the provider is read-only, pushed upstream
//! by a remote-update task. `provider.read_only` is the only switch that
//! suppresses the push.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::context::SyncContext;
use crate::model::{RemoteResource, Resource};

pub const USER_TAG_PREFIX: &str = "user:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSync {
    /// Tags the local row should carry.
    pub tags: BTreeMap<String, String>,
    /// Local tags are missing upstream and may be pushed.
    pub push: bool,
}

#[async_trait]
pub trait MetadataTagger: Send + Sync {
    async fn sync_metadata(
        &self,
        ctx: &SyncContext,
        obj: &Resource,
        ext: &RemoteResource,
        read_only: bool,
    ) -> TagSync;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MirrorTagger;

#[async_trait]
impl MetadataTagger for MirrorTagger {
    async fn sync_metadata(
        &self,
        _ctx: &SyncContext,
        obj: &Resource,
        ext: &RemoteResource,
        read_only: bool,
    ) -> TagSync {
        let mut tags = ext.tags.clone();
        let mut local_only = false;
        for (k, v) in &obj.tags {
            if k.starts_with(USER_TAG_PREFIX) && !ext.tags.contains_key(k) {
                tags.insert(k.clone(), v.clone());
                local_only = true;
            }
        }
        TagSync {
            tags,
            push: local_only && !read_only,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceKind;

    #[tokio::test]
    async fn test_remote_tags_win() {
        let ctx = SyncContext::background("test");
        let local = Resource::new(ResourceKind::SslCertificate, "c").with_tag("a", "1");
        let remote = RemoteResource::new("c-1", "c")
            .with_tag("a", "1")
            .with_tag("b", "2");
        let sync = MirrorTagger.sync_metadata(&ctx, &local, &remote, true).await;
        assert_eq!(sync.tags, remote.tags);
        assert!(!sync.push);
    }

    #[tokio::test]
    async fn test_user_tags_kept_and_pushed_unless_read_only() {
        let ctx = SyncContext::background("test");
        let local = Resource::new(ResourceKind::Disk, "d")
            .with_tag("user:owner", "alice")
            .with_tag("stale", "x");
        let remote = RemoteResource::new("d-1", "d").with_tag("env", "prod");

        let sync = MirrorTagger.sync_metadata(&ctx, &local, &remote, false).await;
        assert_eq!(sync.tags.get("user:owner").map(String::as_str), Some("alice"));
        assert!(!sync.tags.contains_key("stale"));
        assert!(sync.push);

        let sync = MirrorTagger.sync_metadata(&ctx, &local, &remote, true).await;
        assert!(sync.tags.contains_key("user:owner"));
        assert!(!sync.push);
    }
}
