//! Edge session lifecycle and end-to-end dispatch.
//!
//! Runs the full path (shared job queue, dispatcher, lab queue, session,
//! engine) against the in-memory backbone, with the test acting as the
//! edge controller.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use labgrid_core::config::{EngineConfig, HeartbeatConfig, QueueConfig};
use labgrid_core::keys::{lab_heart_key, lab_notify_channel, lab_task_queue};
use labgrid_core::message::DispatchAction;
use labgrid_core::{JobAction, JobMessage, Outbound, SchedulerConfig, epoch_secs};
use labgrid_edge::{Control, ControlContext, EdgeError, EdgeSession};
use labgrid_queue::{Backbone, MemoryBackbone};
use labgrid_state::*;

const LAB: &str = "lab-a";
const KEY: &str = "ak";
const SECRET: &str = "sk";

fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        queue: QueueConfig {
            idle_backoff_ms: 10,
            max_backoff_ms: 50,
            dispatchers: 1,
            ..QueueConfig::default()
        },
        heartbeat: HeartbeatConfig {
            interval_secs: 1,
            ttl_secs: 3,
        },
        engine: EngineConfig {
            node_poll_interval_ms: 10,
            node_poll_retries: 500,
            ..EngineConfig::default()
        },
        ..SchedulerConfig::default()
    }
}

fn test_lab() -> LabRecord {
    LabRecord {
        id: 1,
        uuid: LAB.into(),
        name: "bench".into(),
        access_key: KEY.into(),
        access_secret: SECRET.into(),
        user_id: "user-1".into(),
        status: LabStatus::Offline,
        updated_at: 0,
    }
}

fn node(uuid: &str) -> WorkflowNode {
    WorkflowNode {
        uuid: uuid.into(),
        workflow_id: 1,
        kind: NodeKind::Action,
        disabled: false,
        device_id: format!("dev-{uuid}"),
        action_name: "run".into(),
        action_type: "Generic".into(),
        params: Value::Null,
    }
}

fn seed_workflow(store: &StateStore, nodes: &[&str], edges: &[(&str, &str)]) {
    store
        .put_workflow(&Workflow {
            id: 1,
            lab_id: 1,
            name: "wf".into(),
            created_at: 0,
        })
        .unwrap();
    for n in nodes {
        store.put_workflow_node(&node(n)).unwrap();
    }
    for (source, target) in edges {
        store
            .put_workflow_edge(&WorkflowEdge {
                workflow_id: 1,
                source: source.to_string(),
                target: target.to_string(),
            })
            .unwrap();
    }
}

struct Harness {
    backbone: MemoryBackbone,
    store: StateStore,
    control: Arc<Control>,
}

fn harness() -> Harness {
    let backbone = MemoryBackbone::new();
    let store = StateStore::open_in_memory().unwrap();
    store.put_lab(&test_lab()).unwrap();
    let ctx = ControlContext::new(store.clone(), Arc::new(backbone.clone()), "pod-1", test_config());
    Harness {
        backbone,
        store,
        control: Control::new(ctx),
    }
}

impl Harness {
    async fn connect(&self) -> (Arc<EdgeSession>, mpsc::Receiver<Outbound>) {
        self.control.connect(LAB, KEY, SECRET).await.unwrap()
    }

    async fn submit(&self, msg: &JobMessage) {
        let queue = &self.control.context().config.queue.job_queue;
        self.backbone
            .lpush(queue, &serde_json::to_string(msg).unwrap())
            .await
            .unwrap();
    }

    async fn wait_task(&self, task_uuid: &str, status: TaskStatus) -> WorkflowTask {
        for _ in 0..300 {
            if let Some(task) = self.store.get_task(task_uuid).unwrap()
                && task.status == status
            {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_uuid} never reached {status:?}");
    }
}

async fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> Outbound {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("no frame within timeout")
        .expect("session channel closed")
}

async fn next_dispatch(rx: &mut mpsc::Receiver<Outbound>) -> DispatchAction {
    match next_frame(rx).await {
        Outbound::Dispatch(d) => d,
        other => panic!("expected dispatch, got {other:?}"),
    }
}

fn job_status(task: &str, job: &str, status: &str) -> String {
    json!({
        "action": "job_status",
        "data": {"task_id": task, "job_id": job, "status": status, "return_info": {"ok": true}}
    })
    .to_string()
}

fn host_ready() -> String {
    json!({"action": "host_ready", "data": {"status": "ok"}}).to_string()
}

#[tokio::test]
async fn connect_marks_lab_online_and_owned() {
    let h = harness();
    let (session, _rx) = h.connect().await;

    assert_eq!(h.store.get_lab(LAB).unwrap().unwrap().status, LabStatus::Online);
    assert_eq!(
        h.backbone.get(&lab_heart_key(LAB)).await.unwrap().as_deref(),
        Some(session.conn_id())
    );
    assert!(h.control.context().affinity.has_user(LAB).await.unwrap());
    assert_eq!(h.control.session_count().await, 1);
}

#[tokio::test]
async fn bad_credentials_and_unknown_labs_are_refused() {
    let h = harness();
    let err = h.control.connect(LAB, KEY, "wrong").await.unwrap_err();
    assert!(matches!(err, EdgeError::Unauthorized(_)));

    let err = h.control.connect("lab-zz", KEY, SECRET).await.unwrap_err();
    assert!(matches!(err, EdgeError::LabNotFound(_)));

    assert!(!h.backbone.exists(&lab_heart_key(LAB)).await.unwrap());
    assert_eq!(h.control.session_count().await, 0);
}

#[tokio::test]
async fn second_connection_conflicts_while_first_is_live() {
    let h = harness();
    let (first, _rx) = h.connect().await;

    let err = h.control.connect(LAB, KEY, SECRET).await.unwrap_err();
    assert!(err.is_ownership_conflict());

    assert_eq!(h.control.session_count().await, 1);
    let registered = h.control.session(LAB).await.unwrap();
    assert_eq!(registered.conn_id(), first.conn_id());
    assert!(!first.is_closed());
}

#[tokio::test]
async fn lapsed_ownership_lets_a_new_connection_replace_the_stale_one() {
    let h = harness();
    let (stale, _rx1) = h.connect().await;

    // Simulate the key lapsing between heartbeats.
    h.backbone.del(&lab_heart_key(LAB)).await.unwrap();
    let (fresh, _rx2) = h.connect().await;

    assert!(stale.is_closed());
    assert_eq!(h.control.session_count().await, 1);
    assert_eq!(h.control.session(LAB).await.unwrap().conn_id(), fresh.conn_id());
    // The stale session must not have released the new owner's key.
    assert_eq!(
        h.backbone.get(&lab_heart_key(LAB)).await.unwrap().as_deref(),
        Some(fresh.conn_id())
    );
    assert_eq!(h.store.get_lab(LAB).unwrap().unwrap().status, LabStatus::Online);
}

#[tokio::test]
async fn normal_exit_releases_the_lab() {
    let h = harness();
    let (session, _rx) = h.connect().await;

    session
        .handle_text(&json!({"action": "normal_exit", "data": {}}).to_string())
        .await;

    for _ in 0..200 {
        let offline = h.store.get_lab(LAB).unwrap().unwrap().status == LabStatus::Offline;
        if offline && h.control.session_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(session.is_closed());
    assert!(!h.backbone.exists(&lab_heart_key(LAB)).await.unwrap());
    assert!(!h.control.context().affinity.has_user(LAB).await.unwrap());
    assert_eq!(h.store.get_lab(LAB).unwrap().unwrap().status, LabStatus::Offline);

    // The lab can be claimed again straight away.
    h.connect().await;
}

#[tokio::test]
async fn ping_is_answered_and_bad_frames_get_an_error() {
    let h = harness();
    let (session, mut rx) = h.connect().await;

    session
        .handle_text(&json!({"action": "ping", "data": {"ping_id": "p1", "client_timestamp": 1.5}}).to_string())
        .await;
    match next_frame(&mut rx).await {
        Outbound::Pong(pong) => {
            assert_eq!(pong.ping_id, "p1");
            assert_eq!(pong.client_timestamp, 1.5);
            assert!(pong.server_timestamp > 0.0);
        }
        other => panic!("expected pong, got {other:?}"),
    }

    session.handle_text("{not json").await;
    assert!(matches!(next_frame(&mut rx).await, Outbound::Error(_)));

    session
        .handle_text(&json!({"action": "teleport", "data": {}}).to_string())
        .await;
    match next_frame(&mut rx).await {
        Outbound::Error(e) => assert!(e.message.contains("teleport")),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn device_status_is_persisted_and_published() {
    let h = harness();
    let (session, _rx) = h.connect().await;

    session
        .handle_text(
            &json!({
                "action": "device_status",
                "data": {"device_id": "arm-1", "property_name": "temp", "status": 21.5, "timestamp": 10.0}
            })
            .to_string(),
        )
        .await;

    let props = h.store.list_device_properties(LAB).unwrap();
    assert_eq!(props.len(), 1);
    assert_eq!(props[0].value, json!(21.5));

    let published = h.backbone.published().await;
    assert!(
        published
            .iter()
            .any(|(channel, msg)| channel == &lab_notify_channel(LAB) && msg.contains("device_status"))
    );
}

#[tokio::test]
async fn workflow_runs_end_to_end_through_the_dispatcher() {
    let h = harness();
    seed_workflow(&h.store, &["a", "b", "c"], &[("a", "b"), ("a", "c")]);
    h.control.start().await;
    let (session, mut rx) = h.connect().await;
    session.handle_text(&host_ready()).await;
    assert!(session.is_ready());

    h.submit(&JobMessage::new(JobAction::Start, "task-1", 1, LAB, "user-1"))
        .await;

    let first = next_dispatch(&mut rx).await;
    assert_eq!(first.job_id, "a");
    assert_eq!(first.task_id, "task-1");
    session.handle_text(&job_status("task-1", "a", "success")).await;

    let mut second_wave = vec![next_dispatch(&mut rx).await, next_dispatch(&mut rx).await];
    second_wave.sort_by(|x, y| x.job_id.cmp(&y.job_id));
    assert_eq!(second_wave[0].job_id, "b");
    assert_eq!(second_wave[1].job_id, "c");
    assert!(second_wave[0].server_info.send_timestamp > first.server_info.send_timestamp);
    for d in &second_wave {
        session.handle_text(&job_status("task-1", &d.job_id, "success")).await;
    }

    h.wait_task("task-1", TaskStatus::Success).await;
    let jobs = h.store.list_node_jobs("task-1").unwrap();
    assert_eq!(jobs.len(), 3);
    assert!(jobs.iter().all(|j| j.status == JobStatus::Success));
    assert_eq!(jobs[0].result, json!({"ok": true}));

    // The slot frees once the engine returns.
    for _ in 0..100 {
        if session.running_job().await.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(session.running_job().await.is_none());
    h.control.shutdown().await;
}

#[tokio::test]
async fn nothing_is_consumed_before_host_ready() {
    let h = harness();
    seed_workflow(&h.store, &["a"], &[]);
    h.control.start().await;
    let (session, mut rx) = h.connect().await;

    h.submit(&JobMessage::new(JobAction::Start, "task-1", 1, LAB, "user-1"))
        .await;
    assert!(
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err()
    );

    session.handle_text(&host_ready()).await;
    assert_eq!(next_dispatch(&mut rx).await.job_id, "a");
    h.control.shutdown().await;
}

#[tokio::test]
async fn stop_cancels_a_running_workflow() {
    let h = harness();
    seed_workflow(&h.store, &["a"], &[]);
    h.control.start().await;
    let (session, mut rx) = h.connect().await;
    session.handle_text(&host_ready()).await;

    h.submit(&JobMessage::new(JobAction::Start, "task-1", 1, LAB, "user-1"))
        .await;
    next_dispatch(&mut rx).await;

    h.submit(&JobMessage::new(JobAction::Stop, "task-1", 1, LAB, "user-1"))
        .await;
    match next_frame(&mut rx).await {
        Outbound::CancelTask(cancel) => assert_eq!(cancel.task_id, "task-1"),
        other => panic!("expected cancel, got {other:?}"),
    }
    h.wait_task("task-1", TaskStatus::Cancelled).await;
    for _ in 0..100 {
        if h.control.context().registry.is_empty().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(h.control.context().registry.is_empty().await);
    h.control.shutdown().await;
}

#[tokio::test]
async fn stopping_a_queued_start_keeps_it_from_running() {
    let h = harness();
    seed_workflow(&h.store, &["a"], &[]);
    for task in ["task-1", "task-2"] {
        h.store
            .put_task(&WorkflowTask {
                uuid: task.into(),
                workflow_id: 1,
                lab_uuid: LAB.into(),
                user_id: "user-1".into(),
                status: TaskStatus::Pending,
                error: None,
                created_at: epoch_secs(),
                updated_at: epoch_secs(),
            })
            .unwrap();
    }
    h.control.start().await;
    let (session, mut rx) = h.connect().await;
    session.handle_text(&host_ready()).await;

    h.submit(&JobMessage::new(JobAction::Start, "task-1", 1, LAB, "user-1"))
        .await;
    assert_eq!(next_dispatch(&mut rx).await.task_id, "task-1");

    // task-2 waits behind task-1, then is stopped while still queued.
    h.submit(&JobMessage::new(JobAction::Start, "task-2", 1, LAB, "user-1"))
        .await;
    h.submit(&JobMessage::new(JobAction::Stop, "task-2", 1, LAB, "user-1"))
        .await;
    match next_frame(&mut rx).await {
        Outbound::CancelTask(cancel) => assert_eq!(cancel.task_id, "task-2"),
        other => panic!("expected cancel, got {other:?}"),
    }
    h.wait_task("task-2", TaskStatus::Cancelled).await;

    session
        .handle_text(&job_status("task-1", "a", "success"))
        .await;
    h.wait_task("task-1", TaskStatus::Success).await;

    let queue = lab_task_queue(LAB);
    for _ in 0..100 {
        if h.backbone.llen(&queue).await.unwrap() == 0 && session.running_job().await.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.backbone.llen(&queue).await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(rx.try_recv().is_err(), "task-2 must not reach the edge");
    assert!(session.running_job().await.is_none());
    assert_eq!(h.store.get_task("task-2").unwrap().unwrap().status, TaskStatus::Cancelled);
    h.control.shutdown().await;
}

#[tokio::test]
async fn expired_start_fails_the_task() {
    let h = harness();
    h.control.start().await;
    // An owned lab keeps the dispatcher's pop script active.
    let _session = h.connect().await;

    h.store
        .put_task(&WorkflowTask {
            uuid: "task-old".into(),
            workflow_id: 1,
            lab_uuid: LAB.into(),
            user_id: "user-1".into(),
            status: TaskStatus::Pending,
            error: None,
            created_at: 0,
            updated_at: 0,
        })
        .unwrap();
    let mut msg = JobMessage::new(JobAction::Start, "task-old", 1, LAB, "user-1");
    msg.enqueue_time = Some(epoch_secs() - 3_600);
    h.submit(&msg).await;

    let task = h.wait_task("task-old", TaskStatus::Failed).await;
    assert!(task.error.unwrap().contains("expired"));
    h.control.shutdown().await;
}

#[tokio::test]
async fn material_on_the_control_queue_is_forwarded() {
    let h = harness();
    let (session, mut rx) = h.connect().await;
    session.handle_text(&host_ready()).await;

    h.backbone
        .lpush(
            &labgrid_core::keys::lab_control_queue(LAB),
            &json!({"action": "material", "data": {"slot": 3}}).to_string(),
        )
        .await
        .unwrap();

    match next_frame(&mut rx).await {
        Outbound::Material(data) => assert_eq!(data, json!({"slot": 3})),
        other => panic!("expected material, got {other:?}"),
    }
    h.control.shutdown().await;
}

#[tokio::test]
async fn action_runs_query_send_callback_through_the_control_queue() {
    use labgrid_core::keys::{action_request_key, action_result_key};
    use labgrid_core::{ActionRequest, ActionResult};

    let h = harness();
    h.control.start().await;
    let (session, mut rx) = h.connect().await;
    session.handle_text(&host_ready()).await;

    let request = ActionRequest {
        task_uuid: "act-1".into(),
        lab_uuid: LAB.into(),
        user_id: "user-1".into(),
        job_id: "job-1".into(),
        device_id: "arm-1".into(),
        action_name: "grip".into(),
        action_type: "Gripper".into(),
        action_args: json!({"force": 2}),
    };
    h.backbone
        .set_px(
            &action_request_key("act-1"),
            &serde_json::to_string(&request).unwrap(),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
    h.submit(&JobMessage::new(JobAction::StartAction, "act-1", 0, LAB, "user-1"))
        .await;

    match next_frame(&mut rx).await {
        Outbound::QueryActionStatus(q) => assert_eq!(q.job_id, "job-1"),
        other => panic!("expected query, got {other:?}"),
    }
    session
        .handle_text(
            &json!({
                "action": "report_action_state",
                "data": {
                    "type": "query_action_status", "task_id": "act-1", "job_id": "job-1",
                    "device_id": "arm-1", "action_name": "grip", "free": true
                }
            })
            .to_string(),
        )
        .await;

    let dispatch = next_dispatch(&mut rx).await;
    assert_eq!(dispatch.action, "grip");
    assert_eq!(dispatch.action_args, json!({"force": 2}));
    session.handle_text(&job_status("act-1", "job-1", "success")).await;

    let mut stored = None;
    for _ in 0..300 {
        stored = h.backbone.get(&action_result_key("act-1")).await.unwrap();
        if stored.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let result: ActionResult = serde_json::from_str(&stored.expect("no action result")).unwrap();
    assert!(result.success);
    assert_eq!(result.return_info, json!({"ok": true}));
    h.control.shutdown().await;
}
