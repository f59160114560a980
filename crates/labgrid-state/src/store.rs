//! StateStore: redb-backed state persistence for labgrid.
//!
//! Provides typed operations over labs, workflow definitions, workflow
//! runs, node jobs and device properties. All values are JSON-serialized
//! into redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use labgrid_core::epoch_secs;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [
            LABS,
            WORKFLOWS,
            WORKFLOW_NODES,
            WORKFLOW_EDGES,
            WORKFLOW_TASKS,
            NODE_JOBS,
            DEVICE_PROPERTIES,
        ] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic row helpers ────────────────────────────────────────

    fn put<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Codec))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Storage))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Codec))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list_prefix<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Storage))? {
            let (key, value) = entry.map_err(map_err!(Storage))?;
            if key.value().starts_with(prefix) {
                let item = serde_json::from_slice(value.value()).map_err(map_err!(Codec))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    /// Read-modify-write a single row inside one write transaction.
    ///
    /// Returns the updated value, or `None` when the row does not exist.
    fn update<T, F>(&self, table: Table, key: &str, mutate: F) -> StateResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            let current: Option<T> = match t.get(key).map_err(map_err!(Storage))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Codec))?)
                }
                None => None,
            };
            match current {
                Some(mut value) => {
                    mutate(&mut value);
                    let bytes = serde_json::to_vec(&value).map_err(map_err!(Codec))?;
                    t.insert(key, bytes.as_slice()).map_err(map_err!(Storage))?;
                    Some(value)
                }
                None => None,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    fn delete(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Storage))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Labs ───────────────────────────────────────────────────────

    /// Insert or update a lab record.
    pub fn put_lab(&self, lab: &LabRecord) -> StateResult<()> {
        self.put(LABS, &lab.uuid, lab)?;
        debug!(lab_uuid = %lab.uuid, "lab stored");
        Ok(())
    }

    pub fn get_lab(&self, lab_uuid: &str) -> StateResult<Option<LabRecord>> {
        self.get(LABS, lab_uuid)
    }

    pub fn list_labs(&self) -> StateResult<Vec<LabRecord>> {
        self.list_prefix(LABS, "")
    }

    /// Flip a lab online/offline. Returns the updated record.
    pub fn set_lab_status(&self, lab_uuid: &str, status: LabStatus) -> StateResult<Option<LabRecord>> {
        self.update(LABS, lab_uuid, |lab: &mut LabRecord| {
            lab.status = status;
            lab.updated_at = epoch_secs();
        })
    }

    // ── Workflow definitions ───────────────────────────────────────

    pub fn put_workflow(&self, workflow: &Workflow) -> StateResult<()> {
        self.put(WORKFLOWS, &workflow.id.to_string(), workflow)
    }

    pub fn get_workflow(&self, workflow_id: u64) -> StateResult<Option<Workflow>> {
        self.get(WORKFLOWS, &workflow_id.to_string())
    }

    pub fn put_workflow_node(&self, node: &WorkflowNode) -> StateResult<()> {
        self.put(WORKFLOW_NODES, &node.table_key(), node)
    }

    /// All nodes of a workflow, including group and disabled ones.
    pub fn list_workflow_nodes(&self, workflow_id: u64) -> StateResult<Vec<WorkflowNode>> {
        self.list_prefix(WORKFLOW_NODES, &format!("{workflow_id}:"))
    }

    pub fn put_workflow_edge(&self, edge: &WorkflowEdge) -> StateResult<()> {
        self.put(WORKFLOW_EDGES, &edge.table_key(), edge)
    }

    pub fn list_workflow_edges(&self, workflow_id: u64) -> StateResult<Vec<WorkflowEdge>> {
        self.list_prefix(WORKFLOW_EDGES, &format!("{workflow_id}:"))
    }

    // ── Workflow runs ──────────────────────────────────────────────

    pub fn put_task(&self, task: &WorkflowTask) -> StateResult<()> {
        self.put(WORKFLOW_TASKS, &task.uuid, task)?;
        debug!(task_uuid = %task.uuid, status = ?task.status, "task stored");
        Ok(())
    }

    pub fn get_task(&self, task_uuid: &str) -> StateResult<Option<WorkflowTask>> {
        self.get(WORKFLOW_TASKS, task_uuid)
    }

    /// Set a run's status (and error text). Returns the updated record.
    pub fn update_task_status(
        &self,
        task_uuid: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> StateResult<Option<WorkflowTask>> {
        self.update(WORKFLOW_TASKS, task_uuid, |task: &mut WorkflowTask| {
            task.status = status;
            task.error = error;
            task.updated_at = epoch_secs();
        })
    }

    // ── Node jobs ──────────────────────────────────────────────────

    pub fn put_node_job(&self, job: &WorkflowNodeJob) -> StateResult<()> {
        self.put(NODE_JOBS, &job.table_key(), job)
    }

    pub fn get_node_job(&self, task_uuid: &str, node_uuid: &str) -> StateResult<Option<WorkflowNodeJob>> {
        self.get(NODE_JOBS, &node_job_key(task_uuid, node_uuid))
    }

    pub fn list_node_jobs(&self, task_uuid: &str) -> StateResult<Vec<WorkflowNodeJob>> {
        self.list_prefix(NODE_JOBS, &format!("{task_uuid}:"))
    }

    /// Record a status reported by the edge. Terminal records are not
    /// overwritten; the returned value is the row as stored afterwards.
    pub fn update_node_job(
        &self,
        task_uuid: &str,
        node_uuid: &str,
        status: JobStatus,
        result: Value,
    ) -> StateResult<Option<WorkflowNodeJob>> {
        self.update(NODE_JOBS, &node_job_key(task_uuid, node_uuid), |job: &mut WorkflowNodeJob| {
            if job.status.is_terminal() {
                return;
            }
            job.status = status;
            if !result.is_null() {
                job.result = result;
            }
            job.updated_at = epoch_secs();
        })
    }

    pub fn delete_node_jobs(&self, task_uuid: &str) -> StateResult<u32> {
        let keys: Vec<String> = self
            .list_node_jobs(task_uuid)?
            .iter()
            .map(WorkflowNodeJob::table_key)
            .collect();
        let mut count = 0;
        for key in keys {
            if self.delete(NODE_JOBS, &key)? {
                count += 1;
            }
        }
        Ok(count)
    }

    // ── Device properties ──────────────────────────────────────────

    pub fn put_device_property(&self, property: &DeviceProperty) -> StateResult<()> {
        self.put(DEVICE_PROPERTIES, &property.table_key(), property)
    }

    pub fn list_device_properties(&self, lab_uuid: &str) -> StateResult<Vec<DeviceProperty>> {
        self.list_prefix(DEVICE_PROPERTIES, &format!("{lab_uuid}:"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_lab(uuid: &str) -> LabRecord {
        LabRecord {
            id: 1,
            uuid: uuid.to_string(),
            name: "wet-lab".to_string(),
            access_key: "ak".to_string(),
            access_secret: "sk".to_string(),
            user_id: "user-1".to_string(),
            status: LabStatus::Offline,
            updated_at: 1000,
        }
    }

    fn test_node(workflow_id: u64, uuid: &str) -> WorkflowNode {
        WorkflowNode {
            uuid: uuid.to_string(),
            workflow_id,
            kind: NodeKind::Action,
            disabled: false,
            device_id: "pipette".to_string(),
            action_name: "aspirate".to_string(),
            action_type: "LiquidHandle".to_string(),
            params: json!({"volume": 10}),
        }
    }

    fn test_task(uuid: &str) -> WorkflowTask {
        WorkflowTask {
            uuid: uuid.to_string(),
            workflow_id: 1,
            lab_uuid: "lab-1".to_string(),
            user_id: "user-1".to_string(),
            status: TaskStatus::Pending,
            error: None,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_job(task_uuid: &str, node_uuid: &str) -> WorkflowNodeJob {
        WorkflowNodeJob {
            id: node_uuid.to_string(),
            task_uuid: task_uuid.to_string(),
            node_uuid: node_uuid.to_string(),
            device_id: "pipette".to_string(),
            action_name: "aspirate".to_string(),
            status: JobStatus::Pending,
            result: Value::Null,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    // ── Labs ───────────────────────────────────────────────────────

    #[test]
    fn lab_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let lab = test_lab("lab-1");
        store.put_lab(&lab).unwrap();
        assert_eq!(store.get_lab("lab-1").unwrap(), Some(lab));
        assert!(store.get_lab("missing").unwrap().is_none());
    }

    #[test]
    fn lab_status_update() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_lab(&test_lab("lab-1")).unwrap();

        let updated = store.set_lab_status("lab-1", LabStatus::Online).unwrap().unwrap();
        assert_eq!(updated.status, LabStatus::Online);
        assert!(updated.updated_at > 1000);
        assert!(store.set_lab_status("missing", LabStatus::Online).unwrap().is_none());
    }

    #[test]
    fn lab_credentials() {
        let lab = test_lab("lab-1");
        assert!(lab.credentials_match("ak", "sk"));
        assert!(!lab.credentials_match("ak", "wrong"));
    }

    // ── Workflow definitions ───────────────────────────────────────

    #[test]
    fn nodes_and_edges_are_scoped_by_workflow() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_workflow_node(&test_node(1, "a")).unwrap();
        store.put_workflow_node(&test_node(1, "b")).unwrap();
        store.put_workflow_node(&test_node(12, "c")).unwrap();
        store
            .put_workflow_edge(&WorkflowEdge { workflow_id: 1, source: "a".into(), target: "b".into() })
            .unwrap();

        assert_eq!(store.list_workflow_nodes(1).unwrap().len(), 2);
        assert_eq!(store.list_workflow_nodes(12).unwrap().len(), 1);
        assert_eq!(store.list_workflow_edges(1).unwrap().len(), 1);
        assert!(store.list_workflow_edges(12).unwrap().is_empty());
    }

    #[test]
    fn runnable_excludes_group_and_disabled() {
        let mut node = test_node(1, "a");
        assert!(node.is_runnable());
        node.disabled = true;
        assert!(!node.is_runnable());
        node.disabled = false;
        node.kind = NodeKind::Group;
        assert!(!node.is_runnable());
    }

    // ── Runs ───────────────────────────────────────────────────────

    #[test]
    fn task_status_update() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_task(&test_task("t-1")).unwrap();

        let updated = store
            .update_task_status("t-1", TaskStatus::Failed, Some("cycle".into()))
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Failed);
        assert_eq!(updated.error.as_deref(), Some("cycle"));
        assert!(updated.status.is_terminal());
    }

    #[test]
    fn node_job_terminal_is_sticky() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node_job(&test_job("t-1", "a")).unwrap();

        store
            .update_node_job("t-1", "a", JobStatus::Success, json!({"ok": true}))
            .unwrap();
        let after = store
            .update_node_job("t-1", "a", JobStatus::Running, Value::Null)
            .unwrap()
            .unwrap();
        assert_eq!(after.status, JobStatus::Success);
        assert_eq!(after.result["ok"], true);
    }

    #[test]
    fn node_jobs_list_and_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node_job(&test_job("t-1", "a")).unwrap();
        store.put_node_job(&test_job("t-1", "b")).unwrap();
        store.put_node_job(&test_job("t-2", "a")).unwrap();

        assert_eq!(store.list_node_jobs("t-1").unwrap().len(), 2);
        assert_eq!(store.delete_node_jobs("t-1").unwrap(), 2);
        assert!(store.list_node_jobs("t-1").unwrap().is_empty());
        assert_eq!(store.list_node_jobs("t-2").unwrap().len(), 1);
    }

    #[test]
    fn update_missing_job_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        let result = store
            .update_node_job("t-1", "ghost", JobStatus::Success, Value::Null)
            .unwrap();
        assert!(result.is_none());
    }

    // ── Devices ────────────────────────────────────────────────────

    #[test]
    fn device_property_overwrites_latest() {
        let store = StateStore::open_in_memory().unwrap();
        let mut prop = DeviceProperty {
            lab_uuid: "lab-1".into(),
            device_id: "incubator".into(),
            property_name: "temperature".into(),
            value: json!(36.5),
            timestamp: 1.0,
        };
        store.put_device_property(&prop).unwrap();
        prop.value = json!(37.0);
        store.put_device_property(&prop).unwrap();

        let props = store.list_device_properties("lab-1").unwrap();
        assert_eq!(props.len(), 1);
        assert_eq!(props[0].value, json!(37.0));
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_lab(&test_lab("lab-1")).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        assert!(store.get_lab("lab-1").unwrap().is_some());
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.list_labs().unwrap().is_empty());
        assert!(store.get_workflow(1).unwrap().is_none());
        assert!(store.list_workflow_nodes(1).unwrap().is_empty());
        assert!(store.get_task("nope").unwrap().is_none());
        assert_eq!(store.delete_node_jobs("nope").unwrap(), 0);
    }
}
