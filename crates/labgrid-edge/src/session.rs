//! One edge controller connection.
//!
//! A session owns its lab for as long as the heartbeat holds the ownership
//! key. After the edge reports `host_ready` it drains the lab's task and
//! control queues, running at most one workflow engine and one action
//! engine at a time. Everything the session sends goes through a single
//! channel so frames are never interleaved on the socket.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use labgrid_core::keys::{action_request_key, action_result_key, lab_control_queue, lab_task_queue};
use labgrid_core::message::{self, CancelTask, ErrorReply, Pong, kind};
use labgrid_core::{ActionResult, Inbound, JobAction, JobMessage, Outbound};
use labgrid_engine::{
    ActionEngine, ChannelSender, ControlTask, DagEngine, EdgeSender, Event, SendClock, Task,
    WorkflowInfo,
};
use labgrid_state::{DeviceProperty, LabRecord, LabStatus, TaskStatus};

use crate::context::ControlContext;

const OUTBOUND_CAPACITY: usize = 64;

/// Which engine slot a task occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Job,
    Action,
}

pub struct EdgeSession {
    lab: LabRecord,
    conn_id: String,
    ctx: ControlContext,
    sender: ChannelSender,
    clock: Arc<SendClock>,
    cancel: CancellationToken,
    ready: AtomicBool,
    closed: AtomicBool,
    job_task: RwLock<Option<ControlTask>>,
    action_task: RwLock<Option<ControlTask>>,
    /// Heartbeat and queue consumers.
    loops: Mutex<Vec<JoinHandle<()>>>,
    engines: Mutex<Vec<JoinHandle<Option<()>>>>,
}

impl fmt::Debug for EdgeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdgeSession")
            .field("lab_uuid", &self.lab.uuid)
            .field("conn_id", &self.conn_id)
            .field("ready", &self.is_ready())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl EdgeSession {
    /// Build a session and the receiving end of its outbound channel. The
    /// transport drains the receiver; nothing else writes to the socket.
    pub fn new(
        lab: LabRecord,
        conn_id: impl Into<String>,
        ctx: ControlContext,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (sender, rx) = ChannelSender::channel(OUTBOUND_CAPACITY);
        let session = Arc::new(Self {
            lab,
            conn_id: conn_id.into(),
            ctx,
            sender,
            clock: Arc::new(SendClock::new()),
            cancel: CancellationToken::new(),
            ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            job_task: RwLock::new(None),
            action_task: RwLock::new(None),
            loops: Mutex::new(Vec::new()),
            engines: Mutex::new(Vec::new()),
        });
        (session, rx)
    }

    pub fn lab(&self) -> &LabRecord {
        &self.lab
    }

    pub fn lab_uuid(&self) -> &str {
        &self.lab.uuid
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    /// Fires when the session must end: normal exit, lost ownership or close.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Uuid of the workflow run currently occupying the job slot.
    pub async fn running_job(&self) -> Option<String> {
        self.slot(Slot::Job)
            .read()
            .await
            .as_ref()
            .map(|t| t.task.task_uuid().to_string())
    }

    pub async fn running_action(&self) -> Option<String> {
        self.slot(Slot::Action)
            .read()
            .await
            .as_ref()
            .map(|t| t.task.task_uuid().to_string())
    }

    fn slot(&self, slot: Slot) -> &RwLock<Option<ControlTask>> {
        match slot {
            Slot::Job => &self.job_task,
            Slot::Action => &self.action_task,
        }
    }

    pub(crate) async fn start_heartbeat(&self) {
        let handle = self.ctx.ownership.spawn_heartbeat(
            self.lab.uuid.clone(),
            self.conn_id.clone(),
            Some(self.ctx.affinity.clone()),
            self.cancel.clone(),
        );
        self.loops.lock().await.push(handle);
    }

    /// Queue a frame for the edge. Returns `false` once the writer is gone.
    pub async fn send(&self, msg: Outbound) -> bool {
        match self.sender.send(msg).await {
            Ok(()) => true,
            Err(e) => {
                debug!(lab_uuid = %self.lab.uuid, error = %e, "outbound frame dropped");
                false
            }
        }
    }

    /// Entry point for raw frames from the transport.
    pub async fn handle_text(self: &Arc<Self>, text: &str) {
        match Inbound::parse(text) {
            Ok(msg) => self.handle(msg).await,
            Err(e) => {
                warn!(lab_uuid = %self.lab.uuid, error = %e, "rejected edge frame");
                self.send(Outbound::Error(ErrorReply {
                    message: e.to_string(),
                }))
                .await;
            }
        }
    }

    pub async fn handle(self: &Arc<Self>, msg: Inbound) {
        match msg {
            Inbound::JobStatus(status) => match self.task_for(&status.task_id).await {
                Some(task) => task.on_job_status(&status).await,
                None => debug!(
                    task_id = %status.task_id,
                    job_id = %status.job_id,
                    "job status for a task not running on this session"
                ),
            },
            Inbound::ReportActionState(report) => match self.task_for(&report.task_id).await {
                Some(task) => task.on_action_state(&report).await,
                None => debug!(task_id = %report.task_id, "action state for a task not running on this session"),
            },
            Inbound::DeviceStatus(status) => self.record_device_status(status).await,
            Inbound::Ping(ping) => {
                self.send(Outbound::Pong(Pong {
                    ping_id: ping.ping_id,
                    client_timestamp: ping.client_timestamp,
                    server_timestamp: self.clock.next(),
                }))
                .await;
            }
            Inbound::HostReady(ready) => self.arm(&ready.status).await,
            Inbound::NormalExit => {
                info!(lab_uuid = %self.lab.uuid, "edge requested normal exit");
                self.cancel.cancel();
            }
        }
    }

    async fn task_for(&self, task_id: &str) -> Option<Arc<dyn Task>> {
        for slot in [Slot::Action, Slot::Job] {
            let current = self.slot(slot).read().await;
            if let Some(entry) = current.as_ref()
                && entry.task.task_uuid() == task_id
            {
                return Some(entry.task.clone());
            }
        }
        None
    }

    async fn record_device_status(&self, status: message::DeviceStatus) {
        let property = DeviceProperty {
            lab_uuid: self.lab.uuid.clone(),
            device_id: status.device_id.clone(),
            property_name: status.property_name.clone(),
            value: status.status.clone(),
            timestamp: status.timestamp,
        };
        if let Err(e) = self.ctx.store.put_device_property(&property) {
            warn!(device_id = %status.device_id, error = %e, "failed to persist device status");
        }
        self.ctx
            .notifier
            .notify(
                &self.lab.uuid,
                Event::DeviceStatus {
                    device_id: status.device_id,
                    property_name: status.property_name,
                    status: status.status,
                    timestamp: status.timestamp,
                },
            )
            .await;
    }

    /// Start both queue consumers. Only the first `host_ready` counts.
    async fn arm(self: &Arc<Self>, status: &str) {
        if self.ready.swap(true, Ordering::AcqRel) {
            debug!(lab_uuid = %self.lab.uuid, "duplicate host_ready ignored");
            return;
        }
        info!(lab_uuid = %self.lab.uuid, status, "edge ready, consuming lab queues");
        let task_loop = tokio::spawn(self.clone().consume(lab_task_queue(&self.lab.uuid)));
        let control_loop = tokio::spawn(self.clone().consume(lab_control_queue(&self.lab.uuid)));
        self.loops.lock().await.extend([task_loop, control_loop]);
    }

    async fn consume(self: Arc<Self>, queue: String) {
        let config = &self.ctx.config.queue;
        let (block, idle, max) = (
            config.blocking_timeout(),
            config.idle_backoff(),
            config.max_backoff(),
        );
        let mut backoff = idle;

        // The pop is never raced against cancellation: a reply already in
        // flight would be lost. A message popped after cancellation goes back.
        while !self.cancel.is_cancelled() {
            match self.ctx.backbone.brpop(&queue, block).await {
                Ok(Some(raw)) => {
                    backoff = idle;
                    if self.cancel.is_cancelled() {
                        self.requeue(&queue, &raw).await;
                        break;
                    }
                    if !self.on_queue_message(&queue, raw).await {
                        self.pause(idle).await;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(queue = %queue, error = %e, "lab queue pop failed");
                    self.pause(backoff).await;
                    backoff = (backoff * 2).min(max);
                }
            }
        }
        debug!(queue = %queue, "lab queue consumer stopped");
    }

    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    async fn requeue(&self, queue: &str, raw: &str) {
        if let Err(e) = self.ctx.backbone.lpush(queue, raw).await {
            error!(queue, error = %e, "failed to return message to lab queue");
        }
    }

    /// Returns `false` when the message was put back because the engine
    /// slot it needs is busy.
    async fn on_queue_message(self: &Arc<Self>, queue: &str, raw: String) -> bool {
        let value: Value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(queue, error = %e, "dropping malformed lab queue message");
                return true;
            }
        };
        if value.get("action").and_then(Value::as_str) == Some(kind::MATERIAL) {
            let data = value.get("data").cloned().unwrap_or(Value::Null);
            self.send(Outbound::Material(data)).await;
            return true;
        }
        let msg: JobMessage = match serde_json::from_value(value) {
            Ok(m) => m,
            Err(e) => {
                warn!(queue, error = %e, "dropping unrecognised lab queue message");
                return true;
            }
        };

        match msg.action {
            JobAction::Start => self.start_workflow(queue, msg).await,
            JobAction::StartAction => self.start_action(queue, msg).await,
            JobAction::Stop => {
                self.stop(&msg).await;
                true
            }
            JobAction::Status => {
                self.report_status(&msg).await;
                true
            }
        }
    }

    fn workflow_info(&self, msg: &JobMessage) -> Option<WorkflowInfo> {
        match WorkflowInfo::from_message(msg) {
            Ok(info) => Some(info.with_lab(self.lab.clone())),
            Err(e) => {
                warn!(task_uuid = %msg.task_uuid, error = %e, "dropping invalid job");
                None
            }
        }
    }

    /// Whether the run was settled (stopped, expired or finished) while
    /// its start sat in the queue.
    fn task_settled(&self, task_uuid: &str) -> bool {
        match self.ctx.store.get_task(task_uuid) {
            Ok(Some(task)) if task.status.is_terminal() => {
                info!(task_uuid, status = ?task.status, "task already settled, dropping start");
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!(task_uuid, error = %e, "failed to load task before start");
                false
            }
        }
    }

    async fn action_settled(&self, task_uuid: &str) -> bool {
        match self.ctx.backbone.exists(&action_result_key(task_uuid)).await {
            Ok(true) => {
                info!(task_uuid, "action already has a result, dropping start");
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(task_uuid, error = %e, "failed to check action result before start");
                false
            }
        }
    }

    async fn start_workflow(self: &Arc<Self>, queue: &str, msg: JobMessage) -> bool {
        if self.task_settled(&msg.task_uuid) {
            return true;
        }
        let Some(info) = self.workflow_info(&msg) else {
            return true;
        };
        let engine = DagEngine::new(
            info,
            self.ctx.store.clone(),
            Arc::new(self.sender.clone()),
            self.ctx.notifier.clone(),
            self.ctx.config.engine.clone(),
        )
        .with_clock(self.clock.clone());
        self.launch(Slot::Job, Arc::new(engine), queue, &msg).await
    }

    async fn start_action(self: &Arc<Self>, queue: &str, msg: JobMessage) -> bool {
        if self.action_settled(&msg.task_uuid).await {
            return true;
        }
        let Some(info) = self.workflow_info(&msg) else {
            return true;
        };
        let engine = ActionEngine::new(
            info,
            self.ctx.backbone.clone(),
            Arc::new(self.sender.clone()),
            self.ctx.notifier.clone(),
            self.ctx.config.engine.clone(),
        )
        .with_clock(self.clock.clone());
        self.launch(Slot::Action, Arc::new(engine), queue, &msg).await
    }

    async fn launch(
        self: &Arc<Self>,
        slot: Slot,
        task: Arc<dyn Task>,
        queue: &str,
        msg: &JobMessage,
    ) -> bool {
        let key = task.info().key();
        let mut current = self.slot(slot).write().await;
        if let Some(running) = current.as_ref() {
            debug!(
                running = %running.task.task_uuid(),
                task_uuid = %key.task_uuid,
                "engine slot busy, requeueing start"
            );
            if let Err(e) = self.ctx.affinity.push(queue, msg).await {
                error!(task = %key, error = %e, "failed to requeue start, dropping it");
            }
            return false;
        }

        let entry = ControlTask {
            task,
            cancel: self.cancel.child_token(),
        };
        let (_, loaded) = self.ctx.registry.load_or_store(key.clone(), entry.clone()).await;
        if loaded {
            warn!(task = %key, "task already running, ignoring duplicate start");
            return true;
        }
        *current = Some(entry.clone());
        drop(current);

        let session = self.clone();
        let handle = self.ctx.pool.spawn(async move {
            let result = entry.task.run(entry.cancel.clone()).await;
            session.ctx.registry.delete(&key).await;
            {
                let mut current = session.slot(slot).write().await;
                if current
                    .as_ref()
                    .is_some_and(|t| t.task.task_uuid() == key.task_uuid)
                {
                    *current = None;
                }
            }
            match result {
                Ok(()) => debug!(task = %key, "engine finished"),
                Err(e) => debug!(task = %key, error = %e, "engine finished with error"),
            }
        });
        let mut engines = self.engines.lock().await;
        engines.retain(|h| !h.is_finished());
        engines.push(handle);
        true
    }

    async fn stop(&self, msg: &JobMessage) {
        let key = msg.task_key();
        if let Some(entry) = self.ctx.registry.load(&key).await {
            info!(task = %key, "stopping task");
            entry.cancel.cancel();
            return;
        }

        // Not running here: tell the edge anyway and settle the record.
        info!(task = %key, "stop for a task that is not running");
        self.send(Outbound::CancelTask(CancelTask {
            task_id: msg.task_uuid.clone(),
            job_id: None,
        }))
        .await;
        match self.ctx.store.get_task(&msg.task_uuid) {
            Ok(Some(task)) if !task.status.is_terminal() => {
                match self
                    .ctx
                    .store
                    .update_task_status(&msg.task_uuid, TaskStatus::Cancelled, None)
                {
                    Ok(_) => {
                        self.ctx
                            .notifier
                            .notify(
                                &self.lab.uuid,
                                Event::TaskStatus {
                                    task_uuid: msg.task_uuid.clone(),
                                    status: TaskStatus::Cancelled,
                                    error: None,
                                },
                            )
                            .await
                    }
                    Err(e) => warn!(task = %key, error = %e, "failed to mark task cancelled"),
                }
            }
            Ok(Some(_)) => {}
            Ok(None) => self.cancel_pending_action(&msg.task_uuid).await,
            Err(e) => warn!(task = %key, error = %e, "failed to load task for stop"),
        }
    }

    /// An ad-hoc action stopped before it started gets a failed result, so
    /// its queued start is dropped and the caller sees the outcome.
    async fn cancel_pending_action(&self, task_uuid: &str) {
        let backbone = &self.ctx.backbone;
        match backbone.exists(&action_request_key(task_uuid)).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(task_uuid, error = %e, "failed to look up action request for stop");
                return;
            }
        }
        let result = ActionResult::failed(task_uuid, "cancelled before start");
        let stored = match serde_json::to_string(&result) {
            Ok(raw) => {
                backbone
                    .set_px(
                        &action_result_key(task_uuid),
                        &raw,
                        self.ctx.config.engine.action_result_ttl(),
                    )
                    .await
            }
            Err(e) => {
                warn!(task_uuid, error = %e, "failed to encode cancelled action result");
                return;
            }
        };
        match stored {
            Ok(()) => {
                self.ctx
                    .notifier
                    .notify(
                        &self.lab.uuid,
                        Event::ActionResult {
                            task_uuid: task_uuid.to_string(),
                            success: false,
                        },
                    )
                    .await
            }
            Err(e) => warn!(task_uuid, error = %e, "failed to store cancelled action result"),
        }
    }

    async fn report_status(&self, msg: &JobMessage) {
        match self.ctx.store.get_task(&msg.task_uuid) {
            Ok(Some(task)) => {
                self.ctx
                    .notifier
                    .notify(
                        &self.lab.uuid,
                        Event::TaskStatus {
                            task_uuid: task.uuid,
                            status: task.status,
                            error: task.error,
                        },
                    )
                    .await
            }
            Ok(None) => debug!(task_uuid = %msg.task_uuid, "status requested for unknown task"),
            Err(e) => warn!(task_uuid = %msg.task_uuid, error = %e, "failed to load task status"),
        }
    }

    /// Tear the session down. Safe to call more than once.
    ///
    /// Engines are cancelled and joined before ownership is given up, so a
    /// successor never sees a half-running engine from this connection.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();

        let loops: Vec<_> = self.loops.lock().await.drain(..).collect();
        for result in join_all(loops).await {
            if let Err(e) = result {
                warn!(lab_uuid = %self.lab.uuid, error = %e, "session loop panicked");
            }
        }
        let engines: Vec<_> = self.engines.lock().await.drain(..).collect();
        for result in join_all(engines).await {
            if let Err(e) = result {
                warn!(lab_uuid = %self.lab.uuid, error = %e, "engine panicked");
            }
        }

        let lab_uuid = self.lab.uuid.as_str();
        let superseded = match self.ctx.ownership.holder(lab_uuid).await {
            Ok(Some(holder)) => holder != self.conn_id,
            Ok(None) => false,
            Err(e) => {
                warn!(lab_uuid, error = %e, "could not read ownership key");
                false
            }
        };
        if superseded {
            info!(lab_uuid, conn_id = %self.conn_id, "lab owned by a newer connection, session closed");
            return;
        }

        if let Err(e) = self.ctx.ownership.release(lab_uuid, &self.conn_id).await {
            warn!(lab_uuid, error = %e, "failed to release ownership");
        }
        if let Err(e) = self.ctx.affinity.remove_user(lab_uuid).await {
            warn!(lab_uuid, error = %e, "failed to leave owned set");
        }
        if let Err(e) = self.ctx.store.set_lab_status(lab_uuid, LabStatus::Offline) {
            warn!(lab_uuid, error = %e, "failed to mark lab offline");
        }
        self.ctx
            .notifier
            .notify(
                lab_uuid,
                Event::LabStatus {
                    lab_uuid: lab_uuid.to_string(),
                    status: LabStatus::Offline,
                },
            )
            .await;
        info!(lab_uuid, conn_id = %self.conn_id, "edge session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labgrid_core::SchedulerConfig;
    use labgrid_queue::MemoryBackbone;
    use labgrid_state::{StateStore, Workflow};

    fn session() -> (Arc<EdgeSession>, mpsc::Receiver<Outbound>, StateStore) {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_workflow(&Workflow {
                id: 1,
                lab_id: 1,
                name: "empty".into(),
                created_at: 0,
            })
            .unwrap();
        let ctx = ControlContext::new(
            store.clone(),
            Arc::new(MemoryBackbone::new()),
            "pod-1",
            SchedulerConfig::default(),
        );
        let lab = LabRecord {
            id: 1,
            uuid: "lab-a".into(),
            name: "bench".into(),
            access_key: "ak".into(),
            access_secret: "sk".into(),
            user_id: "user-1".into(),
            status: LabStatus::Online,
            updated_at: 0,
        };
        let (session, rx) = EdgeSession::new(lab, "conn-1", ctx);
        (session, rx, store)
    }

    async fn wait_idle(session: &EdgeSession, store: &StateStore, task_uuid: &str) {
        for _ in 0..200 {
            let done = store
                .get_task(task_uuid)
                .unwrap()
                .is_some_and(|t| t.status == TaskStatus::Success);
            if done && session.running_job().await.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{task_uuid} never finished");
    }

    #[tokio::test]
    async fn finished_engines_are_reaped_on_launch() {
        let (session, _rx, store) = session();
        for i in 0..6 {
            let task = format!("task-{i}");
            let msg = JobMessage::new(JobAction::Start, task.as_str(), 1, "lab-a", "user-1");
            let raw = serde_json::to_string(&msg).unwrap();
            assert!(session.on_queue_message("q", raw).await);
            wait_idle(&session, &store, &task).await;
        }
        // At most the last engine and one still unwinding.
        assert!(session.engines.lock().await.len() <= 2);
        session.close().await;
        assert!(session.engines.lock().await.is_empty());
    }

    #[tokio::test]
    async fn settled_task_is_not_restarted() {
        let (session, mut rx, store) = session();
        store
            .put_task(&labgrid_state::WorkflowTask {
                uuid: "task-1".into(),
                workflow_id: 1,
                lab_uuid: "lab-a".into(),
                user_id: "user-1".into(),
                status: TaskStatus::Cancelled,
                error: None,
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
        let msg = JobMessage::new(JobAction::Start, "task-1", 1, "lab-a", "user-1");
        assert!(session.on_queue_message("q", serde_json::to_string(&msg).unwrap()).await);

        assert!(session.running_job().await.is_none());
        assert!(session.engines.lock().await.is_empty());
        assert_eq!(store.get_task("task-1").unwrap().unwrap().status, TaskStatus::Cancelled);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn debug_names_the_connection() {
        let (session, _rx, _store) = session();
        let shown = format!("{session:?}");
        assert!(shown.contains("lab-a"));
        assert!(shown.contains("conn-1"));
    }
}
