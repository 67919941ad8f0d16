//! Provider sync scheduler - fans a provider out into scope reconciles.
//!
//! The scheduler considers:
//! - Which kinds the provider's drivers serve (and the inventory allows)
//! - Kind scoping (once per provider, once per region, or only via cascade)
//! - Driver feature predicates (CDN support, regional certificates)
//! - The global worker bound shared by every running sync

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::audit::SyncAuditLogger;
use crate::context::SyncContext;
use crate::driver::DriverRegistry;
use crate::inventory::Inventory;
use crate::model::{
    Provider, ProviderSyncState, ProviderSyncStatus, Region, ResourceKind, Scoping,
};
use crate::reconciler::{Phase, ReconcileOptions, Reconciler, Scope, SyncResult, SyncResultSet};

/// A run that started longer ago than this no longer blocks a new one.
const STALE_SYNC_MINUTES: i64 = 30;

/// What part of a provider a sync covers. `None` selects everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncRange {
    pub kinds: Option<BTreeSet<ResourceKind>>,
    pub regions: Option<BTreeSet<String>>,
    /// Membership-only pass; see [`ReconcileOptions::xor`].
    pub xor: bool,
}

impl SyncRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = ResourceKind>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn with_regions<S: Into<String>>(mut self, regions: impl IntoIterator<Item = S>) -> Self {
        self.regions = Some(regions.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_xor(mut self, xor: bool) -> Self {
        self.xor = xor;
        self
    }

    pub fn need_sync(&self, kind: ResourceKind) -> bool {
        match &self.kinds {
            Some(kinds) if !kinds.is_empty() => kinds.contains(&kind),
            _ => true,
        }
    }

    pub fn need_sync_region(&self, region_id: &str) -> bool {
        match &self.regions {
            Some(regions) if !regions.is_empty() => regions.contains(region_id),
            _ => true,
        }
    }
}

/// Error when a provider sync cannot start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// The provider is not in the inventory.
    UnknownProvider(String),
    /// The provider is disabled or unhealthy.
    NotSyncable(String),
    /// A sync of the provider is already queued or running.
    Busy { provider_id: String },
}

impl std::fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleError::UnknownProvider(id) => write!(f, "Unknown provider: {}", id),
            ScheduleError::NotSyncable(id) => {
                write!(f, "Provider {} is disabled or unhealthy", id)
            }
            ScheduleError::Busy { provider_id } => {
                write!(f, "Provider {} is already syncing", provider_id)
            }
        }
    }
}

impl std::error::Error for ScheduleError {}

/// One scope reconcile of a provider sync.
#[derive(Debug, Clone)]
struct Job {
    kind: ResourceKind,
    scope: Scope,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Scheduler for provider-wide syncs.
pub struct SyncScheduler {
    reconciler: Arc<dyn Reconciler>,
    registry: Arc<DriverRegistry>,
    inventory: Arc<Inventory>,
    workers: Arc<Semaphore>,
    states: Mutex<HashMap<String, ProviderSyncState>>,
    audit: SyncAuditLogger,
}

impl SyncScheduler {
    pub fn new(
        reconciler: Arc<dyn Reconciler>,
        registry: Arc<DriverRegistry>,
        inventory: Arc<Inventory>,
        workers: usize,
        audit: SyncAuditLogger,
    ) -> Self {
        Self {
            reconciler,
            registry,
            inventory,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            states: Mutex::new(HashMap::new()),
            audit,
        }
    }

    pub fn state(&self, provider_id: &str) -> ProviderSyncState {
        lock(&self.states)
            .get(provider_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether a new sync of `provider_id` may start: the provider is idle,
    /// or its last run started more than thirty minutes ago.
    pub fn can_sync(&self, provider_id: &str) -> bool {
        let state = self.state(provider_id);
        match state.status {
            ProviderSyncStatus::Idle => true,
            ProviderSyncStatus::Queued | ProviderSyncStatus::Syncing => match state.last_sync {
                Some(started) => Utc::now() - started > ChronoDuration::minutes(STALE_SYNC_MINUTES),
                None => false,
            },
        }
    }

    /// Scope reconciles a sync of `provider` over `regions` consists of.
    fn plan(
        &self,
        provider: &Provider,
        regions: &[Region],
        allowed: &[ResourceKind],
        range: &SyncRange,
    ) -> Vec<Job> {
        let regions: Vec<&Region> = regions
            .iter()
            .filter(|r| range.need_sync_region(&r.id))
            .collect();
        let mut jobs = Vec::new();

        for kind in self.registry.kinds_for(provider.kind) {
            if !range.need_sync(kind) || (!allowed.is_empty() && !allowed.contains(&kind)) {
                continue;
            }
            let features = match self.registry.lookup(provider.kind, kind) {
                Ok(driver) => driver.features(),
                Err(_) => continue,
            };
            let per_region = match (kind, kind.scoping()) {
                (_, Scoping::Parent) => continue,
                (ResourceKind::CdnDomain, _) if !features.supports_cdn => {
                    debug!(provider = %provider.id, "Provider does not serve CDN, skipping");
                    continue;
                }
                (ResourceKind::SslCertificate, _) => features.certificate_belongs_to_region,
                (_, Scoping::Provider) => false,
                (_, Scoping::Region) => true,
            };
            if per_region {
                for region in &regions {
                    jobs.push(Job {
                        kind,
                        scope: Scope::region(provider.clone(), (*region).clone()),
                    });
                }
            } else {
                jobs.push(Job {
                    kind,
                    scope: Scope::provider(provider.clone()),
                });
            }
        }
        jobs
    }

    /// Sync a provider from the inventory, honouring its kind allow-list.
    pub async fn sync_provider_by_id(
        &self,
        ctx: &SyncContext,
        provider_id: &str,
        range: &SyncRange,
    ) -> Result<SyncResultSet, ScheduleError> {
        let entry = self
            .inventory
            .entry(provider_id)
            .map_err(|_| ScheduleError::UnknownProvider(provider_id.to_string()))?;
        self.run(ctx, &entry.provider, &entry.regions, &entry.kinds, range)
            .await
    }

    /// Sync every selected kind of `provider`. Scopes run in parallel,
    /// bounded by the worker pool.
    pub async fn sync_provider(
        &self,
        ctx: &SyncContext,
        provider: &Provider,
        regions: &[Region],
        range: &SyncRange,
    ) -> Result<SyncResultSet, ScheduleError> {
        self.run(ctx, provider, regions, &[], range).await
    }

    async fn run(
        &self,
        ctx: &SyncContext,
        provider: &Provider,
        regions: &[Region],
        allowed: &[ResourceKind],
        range: &SyncRange,
    ) -> Result<SyncResultSet, ScheduleError> {
        if !provider.is_syncable() {
            return Err(ScheduleError::NotSyncable(provider.id.clone()));
        }
        {
            let mut states = lock(&self.states);
            let state = states.entry(provider.id.clone()).or_default();
            let stale = state
                .last_sync
                .is_some_and(|s| Utc::now() - s > ChronoDuration::minutes(STALE_SYNC_MINUTES));
            if state.status != ProviderSyncStatus::Idle && !stale {
                return Err(ScheduleError::Busy {
                    provider_id: provider.id.clone(),
                });
            }
            state.status = ProviderSyncStatus::Queued;
            state.last_sync = Some(Utc::now());
        }

        let jobs = self.plan(provider, regions, allowed, range);
        info!(provider = %provider.id, scopes = jobs.len(), xor = range.xor, "Syncing provider");
        self.set_status(&provider.id, ProviderSyncStatus::Syncing);

        let opts = ReconcileOptions {
            xor: range.xor,
            ..Default::default()
        };
        let runs = jobs.into_iter().map(|job| {
            let ctx = ctx.fork();
            let workers = Arc::clone(&self.workers);
            let opts = &opts;
            async move {
                let key = job.scope.key();
                let result = match ctx.run(workers.acquire_owned()).await {
                    Ok(Ok(_permit)) => {
                        self.reconciler
                            .reconcile(&ctx, job.kind, &job.scope, opts)
                            .await
                    }
                    // Pool closed or caller gone before a worker was free.
                    Ok(Err(_)) | Err(_) => {
                        let mut result = SyncResult::new(job.kind);
                        result.record(Phase::Open, None, &crate::error::SyncError::Cancelled);
                        result
                    }
                };
                (key, result)
            }
        });

        let mut set = SyncResultSet::new();
        for (key, result) in join_all(runs).await {
            if result.is_error() {
                warn!(provider = %provider.id, scope = %key, "{}", result);
            }
            set.insert(&key, result);
        }

        let summary = set.summary();
        {
            let mut states = lock(&self.states);
            let state = states.entry(provider.id.clone()).or_default();
            state.status = ProviderSyncStatus::Idle;
            state.last_sync_end_at = Some(Utc::now());
            state.last_note = Some(summary.clone());
        }
        self.audit.provider_synced(&provider.id, &summary);
        info!(provider = %provider.id, "Provider synced: {}", summary);
        Ok(set)
    }

    fn set_status(&self, provider_id: &str, status: ProviderSyncStatus) {
        lock(&self.states)
            .entry(provider_id.to_string())
            .or_default()
            .status = status;
    }
}
