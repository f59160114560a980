//! Shared services handed to every session and dispatcher loop.

use std::sync::Arc;

use labgrid_core::SchedulerConfig;
use labgrid_engine::{BackboneNotifier, Notifier, TaskRegistry, WorkerPool};
use labgrid_queue::{AffinityQueue, Backbone, OwnershipTracker};
use labgrid_state::StateStore;

#[derive(Clone)]
pub struct ControlContext {
    pub store: StateStore,
    pub backbone: Arc<dyn Backbone>,
    pub affinity: AffinityQueue,
    pub ownership: OwnershipTracker,
    pub notifier: Arc<dyn Notifier>,
    pub registry: Arc<TaskRegistry>,
    /// Bounds how many engines run at once on this replica.
    pub pool: WorkerPool,
    pub config: SchedulerConfig,
}

impl ControlContext {
    pub fn new(
        store: StateStore,
        backbone: Arc<dyn Backbone>,
        schedule_id: impl Into<String>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            affinity: AffinityQueue::new(backbone.clone(), schedule_id, &config.queue),
            ownership: OwnershipTracker::new(backbone.clone(), &config.heartbeat),
            notifier: Arc::new(BackboneNotifier::new(backbone.clone())),
            registry: Arc::new(TaskRegistry::new()),
            pool: WorkerPool::new(config.engine.task_pool_size),
            store,
            backbone,
            config,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_ownership(mut self, ownership: OwnershipTracker) -> Self {
        self.ownership = ownership;
        self
    }

    pub fn schedule_id(&self) -> &str {
        self.affinity.schedule_id()
    }
}
