//! In-memory cloud and the driver that fronts it.
//!
//! [`MemoryCloud`] holds upstream objects per kind and scope, plus child
//! objects per parent. It counts calls, can inject failures and latency, and
//! loads from a JSON snapshot. The binary uses it to replay an inventory; the
//! tests use it as a scripted provider.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Capability, Driver, DriverError, DriverFeatures, RegionHandle, Result, UpstreamScope};
use crate::context::SyncContext;
use crate::model::{Region, RemoteResource, Resource, ResourceKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotScope {
    pub kind: ResourceKind,
    /// `provider_id` or `provider_id/region_external_id`.
    pub scope: String,
    pub resources: Vec<RemoteResource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotChildren {
    pub kind: ResourceKind,
    pub parent: String,
    pub resources: Vec<RemoteResource>,
}

/// Serialized form of a [`MemoryCloud`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudSnapshot {
    #[serde(default)]
    pub scopes: Vec<SnapshotScope>,
    #[serde(default)]
    pub children: Vec<SnapshotChildren>,
}

#[derive(Default)]
struct CloudState {
    objects: BTreeMap<(ResourceKind, String), BTreeMap<String, RemoteResource>>,
    children: BTreeMap<(ResourceKind, String), BTreeMap<String, RemoteResource>>,
    failures: HashMap<ResourceKind, DriverError>,
    /// Keyed by region external id.
    region_failures: HashMap<String, DriverError>,
    calls: HashMap<Capability, usize>,
}

pub struct MemoryCloud {
    state: Mutex<CloudState>,
    latency: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CloudState::default()),
            latency: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn from_snapshot(snapshot: CloudSnapshot) -> Self {
        let cloud = Self::new();
        for scope in snapshot.scopes {
            for r in scope.resources {
                cloud.put(scope.kind, &scope.scope, r);
            }
        }
        for entry in snapshot.children {
            cloud.set_children(entry.kind, &entry.parent, entry.resources);
        }
        cloud
    }

    pub async fn load(path: &Path) -> std::io::Result<Self> {
        let raw = tokio::fs::read(path).await?;
        let snapshot: CloudSnapshot = serde_json::from_slice(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Self::from_snapshot(snapshot))
    }

    fn state(&self) -> MutexGuard<'_, CloudState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn put(&self, kind: ResourceKind, scope: &str, remote: RemoteResource) {
        self.state()
            .objects
            .entry((kind, scope.to_string()))
            .or_default()
            .insert(remote.global_id.clone(), remote);
    }

    /// Replace the whole upstream set for `(kind, scope)`.
    pub fn set(&self, kind: ResourceKind, scope: &str, remotes: Vec<RemoteResource>) {
        let set = remotes
            .into_iter()
            .map(|r| (r.global_id.clone(), r))
            .collect();
        self.state().objects.insert((kind, scope.to_string()), set);
    }

    pub fn remove(&self, kind: ResourceKind, scope: &str, global_id: &str) -> bool {
        self.state()
            .objects
            .get_mut(&(kind, scope.to_string()))
            .and_then(|set| set.remove(global_id))
            .is_some()
    }

    pub fn set_children(&self, kind: ResourceKind, parent: &str, remotes: Vec<RemoteResource>) {
        let set = remotes
            .into_iter()
            .map(|r| (r.global_id.clone(), r))
            .collect();
        self.state().children.insert((kind, parent.to_string()), set);
    }

    pub fn list(&self, kind: ResourceKind, scope: &str) -> Vec<RemoteResource> {
        self.state()
            .objects
            .get(&(kind, scope.to_string()))
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every list call for `kind` fails with `err` until cleared.
    pub fn inject_failure(&self, kind: ResourceKind, err: DriverError) {
        self.state().failures.insert(kind, err);
    }

    pub fn clear_failure(&self, kind: ResourceKind) {
        self.state().failures.remove(&kind);
    }

    pub fn inject_region_failure(&self, region: &str, err: DriverError) {
        self.state().region_failures.insert(region.to_string(), err);
    }

    pub fn clear_region_failure(&self, region: &str) {
        self.state().region_failures.remove(region);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut l) = self.latency.lock() {
            *l = latency;
        }
    }

    pub fn calls(&self, cap: Capability) -> usize {
        self.state().calls.get(&cap).copied().unwrap_or(0)
    }

    /// Calls that would have changed provider state.
    pub fn mutation_calls(&self) -> usize {
        let state = self.state();
        state
            .calls
            .iter()
            .filter(|(cap, _)| cap.is_mutation())
            .map(|(_, n)| n)
            .sum()
    }

    /// Highest number of list calls that were running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, cap: Capability) {
        *self.state().calls.entry(cap).or_default() += 1;
    }

    fn failure(&self, kind: ResourceKind) -> Option<DriverError> {
        self.state().failures.get(&kind).cloned()
    }

    async fn delay(&self, ctx: &SyncContext) -> Result<()> {
        let latency = self.latency.lock().ok().and_then(|l| *l);
        if let Some(latency) = latency {
            ctx.run(tokio::time::sleep(latency))
                .await
                .map_err(|_| DriverError::Cancelled)?;
        }
        Ok(())
    }
}

impl Default for MemoryCloud {
    fn default() -> Self {
        Self::new()
    }
}

/// Driver backed by a shared [`MemoryCloud`].
pub struct MemoryDriver {
    cloud: Arc<MemoryCloud>,
    features: DriverFeatures,
    read_only: bool,
}

impl MemoryDriver {
    pub fn new(cloud: Arc<MemoryCloud>) -> Self {
        Self {
            cloud,
            features: DriverFeatures::default(),
            read_only: false,
        }
    }

    pub fn with_features(mut self, features: DriverFeatures) -> Self {
        self.features = features;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn cloud(&self) -> &Arc<MemoryCloud> {
        &self.cloud
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    fn supports(&self, cap: Capability) -> bool {
        !(self.read_only && cap.is_mutation())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn features(&self) -> DriverFeatures {
        self.features
    }

    async fn list_upstream(
        &self,
        ctx: &SyncContext,
        kind: ResourceKind,
        scope: &UpstreamScope,
    ) -> Result<Vec<RemoteResource>> {
        self.cloud.record(Capability::ListUpstream);
        let now = self.cloud.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.cloud.in_flight);
        self.cloud.max_in_flight.fetch_max(now, Ordering::SeqCst);

        self.cloud.delay(ctx).await?;
        if let Some(err) = self.cloud.failure(kind) {
            return Err(err);
        }
        Ok(self.cloud.list(kind, &scope.key()))
    }

    async fn get_one(
        &self,
        ctx: &SyncContext,
        kind: ResourceKind,
        scope: &UpstreamScope,
        external_id: &str,
    ) -> Result<RemoteResource> {
        self.cloud.record(Capability::GetOne);
        self.cloud.delay(ctx).await?;
        self.cloud
            .state()
            .objects
            .get(&(kind, scope.key()))
            .and_then(|set| set.get(external_id).cloned())
            .ok_or_else(|| DriverError::NotFound(external_id.to_string()))
    }

    async fn create(
        &self,
        ctx: &SyncContext,
        kind: ResourceKind,
        scope: &UpstreamScope,
        spec: &Resource,
    ) -> Result<RemoteResource> {
        if self.read_only {
            return Err(DriverError::NotSupported(Capability::Create));
        }
        self.cloud.record(Capability::Create);
        self.cloud.delay(ctx).await?;
        if let Some(err) = self.cloud.failure(kind) {
            return Err(err);
        }
        let short = Uuid::new_v4().simple().to_string();
        let remote = RemoteResource {
            global_id: format!("{}-{}", kind.keyword(), &short[..8]),
            name: spec.name.clone(),
            status: None,
            zone_id: spec.region.zone_id.clone(),
            project_id: None,
            attributes: spec.attributes.clone(),
            tags: spec.tags.clone(),
        };
        self.cloud.put(kind, &scope.key(), remote.clone());
        Ok(remote)
    }

    async fn delete(
        &self,
        ctx: &SyncContext,
        kind: ResourceKind,
        scope: &UpstreamScope,
        external_id: &str,
    ) -> Result<()> {
        if self.read_only {
            return Err(DriverError::NotSupported(Capability::Delete));
        }
        self.cloud.record(Capability::Delete);
        self.cloud.delay(ctx).await?;
        if let Some(err) = self.cloud.failure(kind) {
            return Err(err);
        }
        if self.cloud.remove(kind, &scope.key(), external_id) {
            Ok(())
        } else {
            Err(DriverError::NotFound(external_id.to_string()))
        }
    }

    async fn list_children(
        &self,
        ctx: &SyncContext,
        _scope: &UpstreamScope,
        parent: &RemoteResource,
        child_kind: ResourceKind,
    ) -> Result<Vec<RemoteResource>> {
        self.cloud.record(Capability::ListChildren);
        self.cloud.delay(ctx).await?;
        if let Some(err) = self.cloud.failure(child_kind) {
            return Err(err);
        }
        Ok(self
            .cloud
            .state()
            .children
            .get(&(child_kind, parent.global_id.clone()))
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn update_tags(
        &self,
        ctx: &SyncContext,
        kind: ResourceKind,
        scope: &UpstreamScope,
        external_id: &str,
        tags: &BTreeMap<String, String>,
        replace: bool,
    ) -> Result<()> {
        if self.read_only {
            return Err(DriverError::NotSupported(Capability::UpdateTags));
        }
        self.cloud.record(Capability::UpdateTags);
        self.cloud.delay(ctx).await?;
        let mut state = self.cloud.state();
        let remote = state
            .objects
            .get_mut(&(kind, scope.key()))
            .and_then(|set| set.get_mut(external_id))
            .ok_or_else(|| DriverError::NotFound(external_id.to_string()))?;
        if replace {
            remote.tags = tags.clone();
        } else {
            remote
                .tags
                .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Ok(())
    }

    async fn region_handle(&self, _ctx: &SyncContext, region: &Region) -> Result<RegionHandle> {
        self.cloud.record(Capability::GetRegionHandle);
        if let Some(err) = self.cloud.state().region_failures.get(&region.external_id) {
            return Err(err.clone());
        }
        Ok(RegionHandle {
            region_id: region.id.clone(),
            external_id: region.external_id.clone(),
            endpoint: None,
        })
    }
}
