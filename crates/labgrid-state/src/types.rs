//! Domain types for the labgrid state store.
//!
//! Labs, workflow definitions (nodes and edges), workflow runs, per-node
//! job records and device properties. All types are serializable to/from
//! JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use labgrid_core::{LabUuid, TaskUuid, WorkflowId};

/// Numeric lab identifier (the relational id, not the uuid).
pub type LabId = u64;

// ── Lab ───────────────────────────────────────────────────────────

/// A physical laboratory and the credentials its edge controller uses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabRecord {
    pub id: LabId,
    pub uuid: LabUuid,
    pub name: String,
    pub access_key: String,
    pub access_secret: String,
    /// Owner of the lab; stamped on sessions as the acting user.
    pub user_id: String,
    pub status: LabStatus,
    /// Unix timestamp of the last status change.
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabStatus {
    Online,
    Offline,
}

impl LabRecord {
    pub fn credentials_match(&self, access_key: &str, access_secret: &str) -> bool {
        self.access_key == access_key && self.access_secret == access_secret
    }
}

// ── Workflow definition ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    pub id: WorkflowId,
    pub lab_id: LabId,
    pub name: String,
    pub created_at: u64,
}

/// Node flavour. Group nodes are visual containers and never execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Action,
    Group,
}

/// One executable step of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowNode {
    pub uuid: String,
    pub workflow_id: WorkflowId,
    pub kind: NodeKind,
    #[serde(default)]
    pub disabled: bool,
    pub device_id: String,
    pub action_name: String,
    pub action_type: String,
    /// Arguments forwarded to the device verbatim.
    #[serde(default)]
    pub params: Value,
}

impl WorkflowNode {
    /// Whether this node takes part in execution.
    pub fn is_runnable(&self) -> bool {
        self.kind == NodeKind::Action && !self.disabled
    }

    pub fn table_key(&self) -> String {
        format!("{}:{}", self.workflow_id, self.uuid)
    }
}

/// `source → target`: target waits for source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct WorkflowEdge {
    pub workflow_id: WorkflowId,
    pub source: String,
    pub target: String,
}

impl WorkflowEdge {
    pub fn table_key(&self) -> String {
        format!("{}:{}->{}", self.workflow_id, self.source, self.target)
    }
}

// ── Workflow run ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// One execution of a workflow (or of an ad-hoc action, with `workflow_id == 0`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowTask {
    pub uuid: TaskUuid,
    pub workflow_id: WorkflowId,
    pub lab_uuid: LabUuid,
    pub user_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }
}

/// Execution record of one node within one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowNodeJob {
    /// Job id sent to the edge; echoed back in `job_status`.
    pub id: String,
    pub task_uuid: TaskUuid,
    pub node_uuid: String,
    pub device_id: String,
    pub action_name: String,
    pub status: JobStatus,
    #[serde(default)]
    pub result: Value,
    pub created_at: u64,
    pub updated_at: u64,
}

impl WorkflowNodeJob {
    pub fn table_key(&self) -> String {
        node_job_key(&self.task_uuid, &self.node_uuid)
    }
}

/// Key of a node job. The job id doubles as the node uuid within a run.
pub fn node_job_key(task_uuid: &str, node_uuid: &str) -> String {
    format!("{task_uuid}:{node_uuid}")
}

// ── Device ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceProperty {
    pub lab_uuid: LabUuid,
    pub device_id: String,
    pub property_name: String,
    pub value: Value,
    pub timestamp: f64,
}

impl DeviceProperty {
    pub fn table_key(&self) -> String {
        format!("{}:{}:{}", self.lab_uuid, self.device_id, self.property_name)
    }
}
