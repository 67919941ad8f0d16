//! Wiring of the engine components.

use std::sync::Arc;

use crate::audit::SyncAuditLogger;
use crate::config::EngineConfig;
use crate::context::SyncContext;
use crate::driver::DriverRegistry;
use crate::identity::{MappingProjectResolver, ProjectResolver};
use crate::inventory::Inventory;
use crate::lifecycle::{DeleteConditions, Lifecycle};
use crate::lockman::LockManager;
use crate::metadata::{MetadataTagger, MirrorTagger};
use crate::model::ResourceKind;
use crate::reconciler::{ReconcileOptions, Reconciler, ResourceReconciler, Scope, SyncResult};
use crate::scheduler::SyncScheduler;
use crate::store::{EventBus, MemoryStore, ResourceStore};
use crate::task::{LifecycleExecutor, LocalTaskRuntime};

pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn ResourceStore>>,
    registry: DriverRegistry,
    inventory: Arc<Inventory>,
    audit: SyncAuditLogger,
    tasks: Option<LocalTaskRuntime>,
    projects: Arc<dyn ProjectResolver>,
    tagger: Arc<dyn MetadataTagger>,
    conditions: DeleteConditions,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            registry: DriverRegistry::new(),
            inventory: Arc::new(Inventory::new()),
            audit: SyncAuditLogger::new_noop(),
            tasks: None,
            projects: Arc::new(MappingProjectResolver),
            tagger: Arc::new(MirrorTagger),
            conditions: DeleteConditions::new(),
        }
    }

    pub fn store(mut self, store: Arc<dyn ResourceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(mut self, registry: DriverRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn inventory(mut self, inventory: Arc<Inventory>) -> Self {
        self.inventory = inventory;
        self
    }

    pub fn audit(mut self, audit: SyncAuditLogger) -> Self {
        self.audit = audit;
        self
    }

    /// Defaults to an autorun [`LocalTaskRuntime`].
    pub fn tasks(mut self, tasks: LocalTaskRuntime) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn projects(mut self, projects: Arc<dyn ProjectResolver>) -> Self {
        self.projects = projects;
        self
    }

    pub fn tagger(mut self, tagger: Arc<dyn MetadataTagger>) -> Self {
        self.tagger = tagger;
        self
    }

    pub fn delete_conditions(mut self, conditions: DeleteConditions) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn build(self) -> Engine {
        let config = self.config;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let registry = Arc::new(self.registry);
        let locks = LockManager::with_audit(config.lock_config(), self.audit.clone());
        let events = EventBus::new(config.event_buffer);
        let tasks = self.tasks.unwrap_or_default();

        let lifecycle = Arc::new(Lifecycle::new(
            Arc::clone(&store),
            Arc::new(tasks.clone()),
            Arc::clone(&registry),
            Arc::clone(&self.inventory),
            locks.clone(),
            events.clone(),
            self.audit.clone(),
            self.conditions,
            config.task_grace_period(),
        ));
        tasks.set_handler(Arc::new(LifecycleExecutor::new(&lifecycle)));

        let reconciler = Arc::new(ResourceReconciler::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            locks.clone(),
            Arc::clone(&lifecycle),
            events.clone(),
            self.audit.clone(),
            self.projects,
            self.tagger,
            config.clone(),
        ));
        let scheduler = SyncScheduler::new(
            reconciler.clone(),
            Arc::clone(&registry),
            Arc::clone(&self.inventory),
            config.workers,
            self.audit.clone(),
        );

        Engine {
            config,
            store,
            registry,
            inventory: self.inventory,
            locks,
            events,
            audit: self.audit,
            tasks,
            lifecycle,
            reconciler,
            scheduler,
        }
    }
}

/// A fully wired engine. Cheap to share behind an `Arc`.
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn ResourceStore>,
    registry: Arc<DriverRegistry>,
    inventory: Arc<Inventory>,
    locks: LockManager,
    events: EventBus,
    audit: SyncAuditLogger,
    tasks: LocalTaskRuntime,
    lifecycle: Arc<Lifecycle>,
    reconciler: Arc<ResourceReconciler>,
    scheduler: SyncScheduler,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub async fn reconcile(
        &self,
        ctx: &SyncContext,
        kind: ResourceKind,
        scope: &Scope,
        opts: &ReconcileOptions,
    ) -> SyncResult {
        self.reconciler.reconcile(ctx, kind, scope, opts).await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    pub fn inventory(&self) -> &Arc<Inventory> {
        &self.inventory
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn audit(&self) -> &SyncAuditLogger {
        &self.audit
    }

    pub fn tasks(&self) -> &LocalTaskRuntime {
        &self.tasks
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn reconciler(&self) -> &Arc<ResourceReconciler> {
        &self.reconciler
    }

    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }
}
