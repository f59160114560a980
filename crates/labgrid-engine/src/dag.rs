//! DAG engine: runs a workflow's node graph in dependency waves.
//!
//! A run loads the live nodes (no group nodes, no disabled nodes) and the
//! edges between them, computes every node's transitive ancestors, and
//! then repeatedly executes all nodes whose ancestors have finished. Each
//! wave is a fan-out/fan-in barrier over the wave pool. The first failing
//! node stops the run; work already in the wave may finish but no new wave
//! starts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use labgrid_core::config::EngineConfig;
use labgrid_core::epoch_secs;
use labgrid_core::message::{
    CancelTask, DeviceJobStatus, DispatchAction, JobStatus as EdgeJobStatus, ReportActionState,
    ServerInfo,
};
use labgrid_core::Outbound;
use labgrid_state::{
    JobStatus, StateStore, TaskStatus, WorkflowEdge, WorkflowNode, WorkflowNodeJob, WorkflowTask,
};

use crate::error::{EngineError, EngineResult};
use crate::notify::{Event, Notifier};
use crate::pool::WorkerPool;
use crate::sender::{EdgeSender, SendClock};
use crate::task::{Task, WorkflowInfo};

/// node uuid → uuids of every node it transitively depends on.
pub type Dependencies = HashMap<String, HashSet<String>>;

/// Compute the transitive ancestor set of every node.
///
/// Edges touching unknown nodes are ignored. Fails on the first cycle,
/// before anything runs.
pub fn build_dependencies(nodes: &[String], edges: &[WorkflowEdge]) -> EngineResult<Dependencies> {
    let known: HashSet<&str> = nodes.iter().map(String::as_str).collect();
    let mut parents: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        if known.contains(edge.source.as_str()) && known.contains(edge.target.as_str()) {
            parents
                .entry(edge.target.as_str())
                .or_default()
                .push(edge.source.as_str());
        }
    }

    let mut deps = Dependencies::with_capacity(nodes.len());
    for node in nodes {
        let mut ancestors = HashSet::new();
        let mut path = HashSet::new();
        collect_ancestors(node, &parents, &mut ancestors, &mut path)?;
        deps.insert(
            node.clone(),
            ancestors.into_iter().map(str::to_string).collect(),
        );
    }
    Ok(deps)
}

fn collect_ancestors<'a>(
    node: &'a str,
    parents: &HashMap<&'a str, Vec<&'a str>>,
    ancestors: &mut HashSet<&'a str>,
    path: &mut HashSet<&'a str>,
) -> EngineResult<()> {
    path.insert(node);
    for &parent in parents.get(node).map(Vec::as_slice).unwrap_or_default() {
        if path.contains(parent) {
            return Err(EngineError::CycleDetected(parent.to_string()));
        }
        if ancestors.insert(parent) {
            collect_ancestors(parent, parents, ancestors, path)?;
        }
    }
    path.remove(node);
    Ok(())
}

/// Nodes with no unfinished ancestors, in stable order.
pub fn ready_nodes(deps: &Dependencies) -> Vec<String> {
    let mut ready: Vec<String> = deps
        .iter()
        .filter(|(_, ancestors)| ancestors.is_empty())
        .map(|(node, _)| node.clone())
        .collect();
    ready.sort();
    ready
}

/// Drop finished nodes from the map and from every ancestor set.
pub fn complete_wave(deps: &mut Dependencies, finished: &[String]) {
    for node in finished {
        deps.remove(node);
    }
    for ancestors in deps.values_mut() {
        for node in finished {
            ancestors.remove(node);
        }
    }
}

/// Everything one node execution needs, cheap to clone into a pool task.
#[derive(Clone)]
struct NodeRunner {
    task_uuid: String,
    lab_uuid: String,
    store: StateStore,
    sender: Arc<dyn EdgeSender>,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
    clock: Arc<SendClock>,
}

impl NodeRunner {
    async fn run_node(&self, node: WorkflowNode, cancel: CancellationToken) -> EngineResult<()> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let msg = Outbound::Dispatch(DispatchAction {
            task_id: self.task_uuid.clone(),
            job_id: node.uuid.clone(),
            node_id: node.uuid.clone(),
            device_id: node.device_id.clone(),
            action: node.action_name.clone(),
            action_type: node.action_type.clone(),
            action_args: node.params.clone(),
            server_info: ServerInfo {
                send_timestamp: self.clock.next(),
            },
        });
        // Surface encoding problems here rather than in the socket writer.
        msg.to_envelope()?;

        self.set_job(&node.uuid, JobStatus::Running, Value::Null).await?;
        if cancel.is_cancelled() {
            self.set_job(&node.uuid, JobStatus::Pending, Value::Null).await?;
            return Err(EngineError::Cancelled);
        }
        if let Err(e) = self.sender.send(msg).await {
            self.set_job(&node.uuid, JobStatus::Failed, Value::Null).await?;
            return Err(e);
        }
        debug!(
            task_uuid = %self.task_uuid,
            node_uuid = %node.uuid,
            device_id = %node.device_id,
            action = %node.action_name,
            "node dispatched"
        );

        for _ in 0..self.config.node_poll_retries {
            tokio::select! {
                _ = tokio::time::sleep(self.config.node_poll_interval()) => {}
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            }
            let job = self
                .store
                .get_node_job(&self.task_uuid, &node.uuid)?
                .ok_or_else(|| EngineError::NotFound(format!("node job {}", node.uuid)))?;
            match job.status {
                JobStatus::Success => return Ok(()),
                JobStatus::Failed => return Err(EngineError::DeviceFailed(node.uuid.clone())),
                JobStatus::Pending | JobStatus::Running => {}
            }
        }

        if self.config.fail_on_node_timeout {
            self.set_job(&node.uuid, JobStatus::Failed, Value::Null).await?;
            return Err(EngineError::Timeout(format!("node {}", node.uuid)));
        }
        warn!(
            task_uuid = %self.task_uuid,
            node_uuid = %node.uuid,
            retries = self.config.node_poll_retries,
            "node did not finish within its poll retries, continuing"
        );
        Ok(())
    }

    async fn set_job(&self, node_uuid: &str, status: JobStatus, result: Value) -> EngineResult<()> {
        if let Some(job) = self
            .store
            .update_node_job(&self.task_uuid, node_uuid, status, result)?
        {
            self.notifier
                .notify(
                    &self.lab_uuid,
                    Event::NodeStatus {
                        task_uuid: self.task_uuid.clone(),
                        node_uuid: node_uuid.to_string(),
                        status: job.status,
                    },
                )
                .await;
        }
        Ok(())
    }
}

pub struct DagEngine {
    info: WorkflowInfo,
    pool: WorkerPool,
    runner: NodeRunner,
}

impl DagEngine {
    pub fn new(
        info: WorkflowInfo,
        store: StateStore,
        sender: Arc<dyn EdgeSender>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        let runner = NodeRunner {
            task_uuid: info.task_uuid.clone(),
            lab_uuid: info.lab_uuid.clone(),
            store,
            sender,
            notifier,
            config,
            clock: Arc::new(SendClock::new()),
        };
        Self {
            pool: WorkerPool::new(runner.config.wave_pool_size),
            info,
            runner,
        }
    }

    /// Share the send clock of the session so timestamps stay monotonic
    /// across engines on the same connection.
    pub fn with_clock(mut self, clock: Arc<SendClock>) -> Self {
        self.runner.clock = clock;
        self
    }

    fn store(&self) -> &StateStore {
        &self.runner.store
    }

    /// Fetch the live nodes and the edges among them.
    fn load(&self) -> EngineResult<(HashMap<String, WorkflowNode>, Vec<WorkflowEdge>)> {
        let workflow_id = self.info.workflow_id;
        let workflow = self
            .store()
            .get_workflow(workflow_id)?
            .ok_or_else(|| EngineError::NotFound(format!("workflow {workflow_id}")))?;
        if let Some(lab) = &self.info.lab
            && lab.id != workflow.lab_id
        {
            return Err(EngineError::Validation(format!(
                "workflow {workflow_id} does not belong to lab {}",
                lab.uuid
            )));
        }

        let nodes: HashMap<String, WorkflowNode> = self
            .store()
            .list_workflow_nodes(workflow_id)?
            .into_iter()
            .filter(WorkflowNode::is_runnable)
            .map(|n| (n.uuid.clone(), n))
            .collect();
        let edges: Vec<WorkflowEdge> = self
            .store()
            .list_workflow_edges(workflow_id)?
            .into_iter()
            .filter(|e| nodes.contains_key(&e.source) && nodes.contains_key(&e.target))
            .collect();
        Ok((nodes, edges))
    }

    fn create_job(&self, node: &WorkflowNode) -> EngineResult<()> {
        let now = epoch_secs();
        self.store().put_node_job(&WorkflowNodeJob {
            id: node.uuid.clone(),
            task_uuid: self.info.task_uuid.clone(),
            node_uuid: node.uuid.clone(),
            device_id: node.device_id.clone(),
            action_name: node.action_name.clone(),
            status: JobStatus::Pending,
            result: Value::Null,
            created_at: now,
            updated_at: now,
        })?;
        Ok(())
    }

    async fn execute(
        &self,
        nodes: &HashMap<String, WorkflowNode>,
        mut deps: Dependencies,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let mut wave = 0u32;
        while !deps.is_empty() {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let ready = ready_nodes(&deps);
            let Some(first) = ready.first() else {
                // Unreachable after build_dependencies, kept as a guard.
                let stuck = deps.keys().next().cloned().unwrap_or_default();
                return Err(EngineError::CycleDetected(stuck));
            };
            wave += 1;
            info!(task_uuid = %self.info.task_uuid, wave, nodes = ready.len(), first = %first, "starting wave");

            let mut handles = Vec::with_capacity(ready.len());
            for uuid in &ready {
                let node = nodes
                    .get(uuid)
                    .cloned()
                    .ok_or_else(|| EngineError::NotFound(format!("node {uuid}")))?;
                self.create_job(&node)?;
                let runner = self.runner.clone();
                let cancel = cancel.clone();
                let token = cancel.clone();
                handles.push(
                    self.pool
                        .spawn_until(token, async move { runner.run_node(node, cancel).await }),
                );
            }

            let mut first_err = None;
            for joined in join_all(handles).await {
                let outcome = match joined {
                    Ok(Some(result)) => result,
                    Ok(None) if cancel.is_cancelled() => Err(EngineError::Cancelled),
                    Ok(None) => Err(EngineError::Internal("wave pool closed".into())),
                    Err(e) => Err(EngineError::Internal(format!("node task failed: {e}"))),
                };
                if let Err(e) = outcome {
                    warn!(task_uuid = %self.info.task_uuid, wave, error = %e, "node failed");
                    first_err.get_or_insert(e);
                }
            }
            if let Some(e) = first_err {
                return Err(e);
            }
            complete_wave(&mut deps, &ready);
        }
        Ok(())
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> EngineResult<()> {
        let (nodes, edges) = self.load()?;
        let ids: Vec<String> = nodes.keys().cloned().collect();
        let deps = build_dependencies(&ids, &edges)?;
        self.store().delete_node_jobs(&self.info.task_uuid)?;
        debug!(task_uuid = %self.info.task_uuid, nodes = ids.len(), edges = edges.len(), "workflow loaded");
        self.execute(&nodes, deps, cancel).await
    }

    async fn set_task_status(&self, status: TaskStatus, error: Option<String>) {
        let store = self.store();
        let updated = match store.update_task_status(&self.info.task_uuid, status, error.clone()) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => {
                let now = epoch_secs();
                store.put_task(&WorkflowTask {
                    uuid: self.info.task_uuid.clone(),
                    workflow_id: self.info.workflow_id,
                    lab_uuid: self.info.lab_uuid.clone(),
                    user_id: self.info.user_id.clone(),
                    status,
                    error: error.clone(),
                    created_at: now,
                    updated_at: now,
                })
            }
            Err(e) => Err(e),
        };
        if let Err(e) = updated {
            error!(task_uuid = %self.info.task_uuid, error = %e, "failed to record task status");
        }
        self.runner
            .notifier
            .notify(
                &self.info.lab_uuid,
                Event::TaskStatus {
                    task_uuid: self.info.task_uuid.clone(),
                    status,
                    error,
                },
            )
            .await;
    }
}

#[async_trait]
impl Task for DagEngine {
    fn info(&self) -> &WorkflowInfo {
        &self.info
    }

    async fn run(&self, cancel: CancellationToken) -> EngineResult<()> {
        info!(
            task_uuid = %self.info.task_uuid,
            workflow_id = self.info.workflow_id,
            lab_uuid = %self.info.lab_uuid,
            "workflow run starting"
        );
        if let Some(task) = self.store().get_task(&self.info.task_uuid)?
            && task.status.is_terminal()
        {
            info!(task_uuid = %self.info.task_uuid, status = ?task.status, "task already settled, not running it");
            return Err(EngineError::AlreadySettled(self.info.task_uuid.clone()));
        }
        self.set_task_status(TaskStatus::Running, None).await;

        let result = self.run_inner(&cancel).await;
        match &result {
            Ok(()) => {
                info!(task_uuid = %self.info.task_uuid, "workflow run succeeded");
                self.set_task_status(TaskStatus::Success, None).await;
            }
            Err(EngineError::Cancelled) => {
                info!(task_uuid = %self.info.task_uuid, "workflow run cancelled");
                let cancel_msg = Outbound::CancelTask(CancelTask {
                    task_id: self.info.task_uuid.clone(),
                    job_id: None,
                });
                if let Err(e) = self.runner.sender.send(cancel_msg).await {
                    debug!(task_uuid = %self.info.task_uuid, error = %e, "cancel_task not delivered");
                }
                self.set_task_status(TaskStatus::Cancelled, None).await;
            }
            Err(e) => {
                warn!(task_uuid = %self.info.task_uuid, error = %e, "workflow run failed");
                self.set_task_status(TaskStatus::Failed, Some(e.to_string())).await;
            }
        }
        result
    }

    async fn on_job_status(&self, status: &EdgeJobStatus) {
        if status.task_id != self.info.task_uuid {
            return;
        }
        let job_status = match status.status {
            DeviceJobStatus::Pending => JobStatus::Pending,
            DeviceJobStatus::Running => JobStatus::Running,
            DeviceJobStatus::Success => JobStatus::Success,
            DeviceJobStatus::Failed => JobStatus::Failed,
        };
        let result = if status.return_info.is_null() {
            status.feedback_data.clone()
        } else {
            status.return_info.clone()
        };
        match self.runner.set_job(&status.job_id, job_status, result).await {
            Ok(()) => debug!(
                task_uuid = %status.task_id,
                job_id = %status.job_id,
                status = ?job_status,
                "node status recorded"
            ),
            Err(e) => warn!(task_uuid = %status.task_id, job_id = %status.job_id, error = %e, "failed to record node status"),
        }
    }

    async fn on_action_state(&self, report: &ReportActionState) {
        debug!(task_uuid = %report.task_id, job_id = %report.job_id, "workflow runs ignore action state reports");
    }
}
