//! Identifiers and queue messages shared by every labgrid crate.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a lab (the `uuid` column, not the numeric id).
pub type LabUuid = String;

/// Unique identifier for one workflow run.
pub type TaskUuid = String;

/// Persisted workflow identifier.
pub type WorkflowId = u64;

// ── Task keys ──────────────────────────────────────────────────────

/// Identifies one running execution. At most one engine per key runs
/// inside a process; the affinity queue makes that cluster-wide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowTaskKey {
    pub task_uuid: TaskUuid,
    pub workflow_id: WorkflowId,
}

impl WorkflowTaskKey {
    pub fn new(task_uuid: impl Into<String>, workflow_id: WorkflowId) -> Self {
        Self {
            task_uuid: task_uuid.into(),
            workflow_id,
        }
    }
}

impl fmt::Display for WorkflowTaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.task_uuid, self.workflow_id)
    }
}

// ── Job queue ──────────────────────────────────────────────────────

/// What a job message asks the owning replica to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    Start,
    Stop,
    Status,
    StartAction,
}

impl JobAction {
    /// Workflow jobs go to the task queue, ad-hoc actions to the control queue.
    pub fn is_control(self) -> bool {
        matches!(self, JobAction::StartAction)
    }
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobAction::Start => "start",
            JobAction::Stop => "stop",
            JobAction::Status => "status",
            JobAction::StartAction => "start_action",
        };
        f.write_str(s)
    }
}

/// Message carried on the shared job queue and the per-lab queues.
///
/// `enqueue_time` and `attempt_count` are maintained by the affinity pop
/// script; producers normally leave them unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub action: JobAction,
    pub task_uuid: TaskUuid,
    #[serde(default)]
    pub workflow_id: WorkflowId,
    #[serde(default)]
    pub lab_uuid: Option<LabUuid>,
    #[serde(default)]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueue_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_count: Option<u32>,
}

impl JobMessage {
    pub fn new(
        action: JobAction,
        task_uuid: impl Into<String>,
        workflow_id: WorkflowId,
        lab_uuid: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            action,
            task_uuid: task_uuid.into(),
            workflow_id,
            lab_uuid: Some(lab_uuid.into()),
            user_id: user_id.into(),
            enqueue_time: None,
            attempt_count: None,
        }
    }

    pub fn task_key(&self) -> WorkflowTaskKey {
        WorkflowTaskKey::new(self.task_uuid.clone(), self.workflow_id)
    }

    /// Whether the message has aged past `expire_secs` at `now` (unix seconds).
    pub fn is_expired(&self, now: u64, expire_secs: u64) -> bool {
        self.enqueue_time
            .is_some_and(|t| now.saturating_sub(t) > expire_secs)
    }
}

// ── Device actions ─────────────────────────────────────────────────

/// Which half of a device exchange an [`ActionKey`] tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    /// "Is this action available right now?"
    #[serde(rename = "query_action_status")]
    QueryStatus,
    /// "Has the dispatched action completed?"
    #[serde(rename = "job_call_back_status")]
    Callback,
}

/// Identifies one outstanding device-action exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionKey {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub task_id: TaskUuid,
    pub job_id: String,
    pub device_id: String,
    pub action_name: String,
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}:{}:{}:{}:{}",
            self.kind, self.task_id, self.job_id, self.device_id, self.action_name
        )
    }
}

/// Ad-hoc action request, stashed under `workflow_action:<task>` by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub task_uuid: TaskUuid,
    #[serde(default)]
    pub lab_uuid: LabUuid,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub action_name: String,
    #[serde(default)]
    pub action_type: String,
    #[serde(default)]
    pub action_args: serde_json::Value,
}

impl ActionRequest {
    /// Names of required fields that are empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        for (name, value) in [
            ("task_uuid", &self.task_uuid),
            ("lab_uuid", &self.lab_uuid),
            ("job_id", &self.job_id),
            ("device_id", &self.device_id),
            ("action_name", &self.action_name),
            ("action_type", &self.action_type),
        ] {
            if value.is_empty() {
                missing.push(name);
            }
        }
        missing
    }
}

/// Terminal outcome of an ad-hoc action, stored under `workflow_action:res:<task>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub task_uuid: TaskUuid,
    pub success: bool,
    /// Status string reported by the device, if it ever reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub return_info: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: u64,
}

impl ActionResult {
    pub fn failed(task_uuid: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_uuid: task_uuid.into(),
            success: false,
            status: None,
            return_info: serde_json::Value::Null,
            error: Some(error.into()),
            finished_at: epoch_secs(),
        }
    }
}

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current unix time in fractional seconds, the timestamp format of the edge protocol.
pub fn epoch_secs_f64() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
