//! Test helpers for cloudsync integration tests.
//!
//! A harness wires an engine to an in-memory store and an in-memory cloud
//! with one provider (`p1`) and one region (`r1`, upstream `cn-north-1`).
//! A second region (`r2`, upstream `cn-south-1`) is available for tests that
//! need two scopes of the same kind.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use cloudsync::driver::{DriverRegistry, MemoryCloud, MemoryDriver};
use cloudsync::inventory::Inventory;
use cloudsync::model::{Provider, ProviderKind, Region, RemoteResource, Resource, ResourceKind};
use cloudsync::store::ScopeFilter;
use cloudsync::task::LocalTaskRuntime;
use cloudsync::{
    Engine, EngineConfig, Event, MemoryStore, ReconcileOptions, ResourceStore, Scope,
    SyncAuditLogger, SyncContext, SyncResult,
};

pub const PROVIDER: &str = "p1";
pub const REGION: &str = "r1";
pub const REGION_EXT: &str = "cn-north-1";
pub const DOMAIN: &str = "d1";
pub const REGION2: &str = "r2";
pub const REGION2_EXT: &str = "cn-south-1";

/// Knobs for building a harness.
#[derive(Default)]
pub struct HarnessOptions {
    pub read_only: bool,
    /// Tasks stay queued until run by hand.
    pub manual_tasks: bool,
    pub config: Option<EngineConfig>,
    /// Latency of every store write.
    pub store_latency: Option<Duration>,
}

pub struct Harness {
    pub engine: Engine,
    pub cloud: Arc<MemoryCloud>,
    pub store: Arc<MemoryStore>,
    pub provider: Provider,
    pub region: Region,
}

pub fn harness() -> Harness {
    harness_with(HarnessOptions::default())
}

pub fn read_only_harness() -> Harness {
    harness_with(HarnessOptions {
        read_only: true,
        ..Default::default()
    })
}

pub fn harness_with(opts: HarnessOptions) -> Harness {
    let cloud = Arc::new(MemoryCloud::new());
    let store = Arc::new(match opts.store_latency {
        Some(latency) => MemoryStore::new().with_write_latency(latency),
        None => MemoryStore::new(),
    });

    let provider = Provider::new(PROVIDER, ProviderKind::Aws, DOMAIN).with_read_only(opts.read_only);
    let region = Region::new(REGION, REGION_EXT, ProviderKind::Aws);
    let inventory = Arc::new(Inventory::new());
    inventory.add_provider(provider.clone(), vec![region.clone()]);

    let mut registry = DriverRegistry::new();
    registry.register_all(
        ProviderKind::Aws,
        ResourceKind::ALL,
        Arc::new(MemoryDriver::new(Arc::clone(&cloud))),
    );

    let tasks = if opts.manual_tasks {
        LocalTaskRuntime::manual()
    } else {
        LocalTaskRuntime::new()
    };
    let engine = Engine::builder(opts.config.unwrap_or_default())
        .store(store.clone())
        .registry(registry)
        .inventory(inventory)
        .audit(SyncAuditLogger::new_noop())
        .tasks(tasks)
        .build();

    Harness {
        engine,
        cloud,
        store,
        provider,
        region,
    }
}

pub fn ctx() -> SyncContext {
    SyncContext::background("test")
}

impl Harness {
    /// The regional scope `p1-r1`.
    pub fn scope(&self) -> Scope {
        Scope::region(self.provider.clone(), self.region.clone())
    }

    pub fn second_region(&self) -> Region {
        Region::new(REGION2, REGION2_EXT, ProviderKind::Aws)
    }

    pub fn scope_in(&self, region: &Region) -> Scope {
        Scope::region(self.provider.clone(), region.clone())
    }

    /// Replace the upstream set of `kind` in another region.
    pub fn upstream_in(&self, region: &Region, kind: ResourceKind, remotes: Vec<RemoteResource>) {
        self.cloud
            .set(kind, &format!("{}/{}", PROVIDER, region.external_id), remotes);
    }

    pub fn mirror_in(&self, region: &Region, kind: ResourceKind, name: &str, external_id: &str) -> Resource {
        self.mirror(kind, name, external_id).with_region(&region.id)
    }

    /// Key the in-memory cloud files regional objects under.
    pub fn upstream_key(&self) -> String {
        format!("{}/{}", PROVIDER, REGION_EXT)
    }

    /// Replace the upstream set of `kind` in the region.
    pub fn upstream(&self, kind: ResourceKind, remotes: Vec<RemoteResource>) {
        self.cloud.set(kind, &self.upstream_key(), remotes);
    }

    pub async fn reconcile(&self, kind: ResourceKind) -> SyncResult {
        self.reconcile_with(kind, &ReconcileOptions::default()).await
    }

    pub async fn reconcile_with(&self, kind: ResourceKind, opts: &ReconcileOptions) -> SyncResult {
        self.engine.reconcile(&ctx(), kind, &self.scope(), opts).await
    }

    /// A row of `kind` mirrored from `external_id` in the region.
    pub fn mirror(&self, kind: ResourceKind, name: &str, external_id: &str) -> Resource {
        Resource::new(kind, name)
            .with_external(PROVIDER, external_id)
            .with_region(REGION)
            .with_domain(DOMAIN)
    }

    pub async fn seed(&self, row: Resource) -> Resource {
        self.store.insert(row).await.unwrap()
    }

    /// Active top-level rows of `kind` in the region, by external id.
    pub async fn rows(&self, kind: ResourceKind) -> Vec<Resource> {
        let filter = ScopeFilter::Scope {
            provider_id: Some(PROVIDER.to_string()),
            region_id: Some(REGION.to_string()),
        };
        let mut rows: Vec<Resource> = self
            .store
            .list_by_scope(kind, &filter)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.is_active())
            .collect();
        rows.sort_by(|a, b| a.managed.external_id.cmp(&b.managed.external_id));
        rows
    }

    pub async fn external_ids(&self, kind: ResourceKind) -> Vec<String> {
        self.rows(kind)
            .await
            .into_iter()
            .filter_map(|r| r.managed.external_id)
            .collect()
    }

    pub async fn children(&self, parent_id: &str, kind: ResourceKind) -> Vec<String> {
        let mut ids: Vec<String> = self
            .store
            .list_children(parent_id, Some(kind))
            .await
            .unwrap()
            .into_iter()
            .filter_map(|r| r.managed.external_id)
            .collect();
        ids.sort();
        ids
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.engine.events().subscribe()
    }
}

/// Drain every event currently buffered in `rx`.
pub fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
