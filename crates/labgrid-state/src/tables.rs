//! redb table definitions for the labgrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Child records use `{parent}:{child}` keys so a prefix scan finds all
//! children of one parent.

use redb::TableDefinition;

/// Lab records keyed by `{lab_uuid}`.
pub const LABS: TableDefinition<&str, &[u8]> = TableDefinition::new("labs");

/// Workflow headers keyed by `{workflow_id}`.
pub const WORKFLOWS: TableDefinition<&str, &[u8]> = TableDefinition::new("workflows");

/// Workflow nodes keyed by `{workflow_id}:{node_uuid}`.
pub const WORKFLOW_NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("workflow_nodes");

/// Workflow edges keyed by `{workflow_id}:{source}->{target}`.
pub const WORKFLOW_EDGES: TableDefinition<&str, &[u8]> = TableDefinition::new("workflow_edges");

/// Workflow runs keyed by `{task_uuid}`.
pub const WORKFLOW_TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("workflow_tasks");

/// Per-run node execution records keyed by `{task_uuid}:{node_uuid}`.
pub const NODE_JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("node_jobs");

/// Latest device property values keyed by `{lab_uuid}:{device_id}:{property}`.
pub const DEVICE_PROPERTIES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("device_properties");
