//! Running executions and the process-wide table that deduplicates them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use labgrid_core::message::{JobStatus, ReportActionState};
use labgrid_core::{JobAction, JobMessage, WorkflowId, WorkflowTaskKey};
use labgrid_state::LabRecord;

use crate::error::{EngineError, EngineResult};

/// Job descriptor built from a dequeued message. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowInfo {
    pub action: JobAction,
    pub task_uuid: String,
    pub workflow_id: WorkflowId,
    pub lab_uuid: String,
    pub user_id: String,
    pub lab: Option<LabRecord>,
}

impl WorkflowInfo {
    pub fn from_message(msg: &JobMessage) -> EngineResult<Self> {
        let lab_uuid = msg
            .lab_uuid
            .clone()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| EngineError::Validation(format!("job {} has no lab_uuid", msg.task_uuid)))?;
        if msg.task_uuid.is_empty() {
            return Err(EngineError::Validation("job has no task_uuid".into()));
        }
        Ok(Self {
            action: msg.action,
            task_uuid: msg.task_uuid.clone(),
            workflow_id: msg.workflow_id,
            lab_uuid,
            user_id: msg.user_id.clone(),
            lab: None,
        })
    }

    pub fn with_lab(mut self, lab: LabRecord) -> Self {
        self.lab = Some(lab);
        self
    }

    pub fn key(&self) -> WorkflowTaskKey {
        WorkflowTaskKey::new(self.task_uuid.clone(), self.workflow_id)
    }
}

/// An engine instance bound to one edge session.
#[async_trait]
pub trait Task: Send + Sync {
    fn info(&self) -> &WorkflowInfo;

    /// Execute to completion, observing `cancel` at every suspension point.
    async fn run(&self, cancel: CancellationToken) -> EngineResult<()>;

    /// A `job_status` frame for this task's id arrived.
    async fn on_job_status(&self, status: &JobStatus);

    /// A `report_action_state` frame for this task's id arrived.
    async fn on_action_state(&self, report: &ReportActionState);

    fn task_uuid(&self) -> &str {
        &self.info().task_uuid
    }
}

#[derive(Clone)]
pub struct ControlTask {
    pub task: Arc<dyn Task>,
    pub cancel: CancellationToken,
}

/// Process-wide table of running executions keyed by [`WorkflowTaskKey`].
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<WorkflowTaskKey, ControlTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert if absent. Returns the stored entry and whether it was
    /// already present (in which case `entry` was not stored).
    pub async fn load_or_store(&self, key: WorkflowTaskKey, entry: ControlTask) -> (ControlTask, bool) {
        let mut tasks = self.tasks.write().await;
        if let Some(existing) = tasks.get(&key) {
            return (existing.clone(), true);
        }
        tasks.insert(key, entry.clone());
        (entry, false)
    }

    pub async fn load(&self, key: &WorkflowTaskKey) -> Option<ControlTask> {
        self.tasks.read().await.get(key).cloned()
    }

    pub async fn delete(&self, key: &WorkflowTaskKey) -> Option<ControlTask> {
        self.tasks.write().await.remove(key)
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}
