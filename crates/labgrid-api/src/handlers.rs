//! REST API handlers.
//!
//! Reads go straight to the `StateStore` or the backbone. Anything that
//! has to happen on the lab (runs, stops, actions) is turned into a job
//! message on the shared queue; the replica owning the lab picks it up.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use labgrid_core::keys::{action_request_key, action_result_key};
use labgrid_core::{ActionRequest, ActionResult, JobAction, JobMessage, epoch_secs};
use labgrid_engine::build_dependencies;
use labgrid_state::*;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn internal(e: impl std::fmt::Display) -> axum::response::Response {
    error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
}

async fn enqueue(state: &ApiState, msg: &JobMessage) -> Result<(), axum::response::Response> {
    state
        .queue
        .push(&state.config.queue.job_queue, msg)
        .await
        .map_err(|e| {
            warn!(task_uuid = %msg.task_uuid, action = %msg.action, error = %e, "failed to enqueue job");
            error_response("job queue unavailable", StatusCode::SERVICE_UNAVAILABLE).into_response()
        })
}

/// Body returned for anything that was queued rather than done inline.
#[derive(Debug, Serialize, Deserialize)]
pub struct Accepted {
    pub task_uuid: String,
    pub action: JobAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

// ── Health ─────────────────────────────────────────────────────

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    "ok"
}

// ── Labs ───────────────────────────────────────────────────────

/// GET /api/v1/labs
pub async fn list_labs(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_labs() {
        Ok(labs) => ApiResponse::ok(labs).into_response(),
        Err(e) => internal(e),
    }
}

/// POST /api/v1/labs
pub async fn create_lab(
    State(state): State<ApiState>,
    Json(lab): Json<LabRecord>,
) -> impl IntoResponse {
    if lab.uuid.is_empty() || lab.access_key.is_empty() || lab.access_secret.is_empty() {
        return error_response("uuid, access_key and access_secret are required", StatusCode::BAD_REQUEST)
            .into_response();
    }
    match state.store.put_lab(&lab) {
        Ok(()) => (StatusCode::CREATED, ApiResponse::ok(lab)).into_response(),
        Err(e) => internal(e),
    }
}

/// GET /api/v1/labs/:lab_uuid/devices
pub async fn list_devices(
    State(state): State<ApiState>,
    Path(lab_uuid): Path<String>,
) -> impl IntoResponse {
    match state.store.list_device_properties(&lab_uuid) {
        Ok(props) => ApiResponse::ok(props).into_response(),
        Err(e) => internal(e),
    }
}

// ── Workflows ──────────────────────────────────────────────────

/// A workflow with its whole graph.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub workflow: Workflow,
    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
}

/// POST /api/v1/workflows
pub async fn create_workflow(
    State(state): State<ApiState>,
    Json(def): Json<WorkflowDefinition>,
) -> impl IntoResponse {
    let workflow_id = def.workflow.id;
    if def.nodes.iter().any(|n| n.workflow_id != workflow_id)
        || def.edges.iter().any(|e| e.workflow_id != workflow_id)
    {
        return error_response("nodes and edges must belong to the workflow", StatusCode::BAD_REQUEST)
            .into_response();
    }
    // Reject cycles up front; a run would fail on them anyway.
    let runnable: Vec<String> = def
        .nodes
        .iter()
        .filter(|n| n.is_runnable())
        .map(|n| n.uuid.clone())
        .collect();
    if let Err(e) = build_dependencies(&runnable, &def.edges) {
        return error_response(&e.to_string(), StatusCode::BAD_REQUEST).into_response();
    }

    let stored = state
        .store
        .put_workflow(&def.workflow)
        .and_then(|()| def.nodes.iter().try_for_each(|n| state.store.put_workflow_node(n)))
        .and_then(|()| def.edges.iter().try_for_each(|e| state.store.put_workflow_edge(e)));
    match stored {
        Ok(()) => (StatusCode::CREATED, ApiResponse::ok(def)).into_response(),
        Err(e) => internal(e),
    }
}

// ── Runs ───────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub user_id: String,
}

/// POST /api/v1/labs/:lab_uuid/workflows/:workflow_id/run
pub async fn run_workflow(
    State(state): State<ApiState>,
    Path((lab_uuid, workflow_id)): Path<(String, u64)>,
    body: Option<Json<RunRequest>>,
) -> impl IntoResponse {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let lab = match state.store.get_lab(&lab_uuid) {
        Ok(Some(lab)) => lab,
        Ok(None) => return error_response("lab not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => return internal(e),
    };
    match state.store.get_workflow(workflow_id) {
        Ok(Some(wf)) if wf.lab_id == lab.id => {}
        Ok(Some(_)) => {
            return error_response("workflow does not belong to lab", StatusCode::BAD_REQUEST)
                .into_response();
        }
        Ok(None) => return error_response("workflow not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => return internal(e),
    }

    let now = epoch_secs();
    let task = WorkflowTask {
        uuid: Uuid::new_v4().to_string(),
        workflow_id,
        lab_uuid: lab_uuid.clone(),
        user_id: req.user_id.clone(),
        status: TaskStatus::Pending,
        error: None,
        created_at: now,
        updated_at: now,
    };
    if let Err(e) = state.store.put_task(&task) {
        return internal(e);
    }
    let msg = JobMessage::new(JobAction::Start, &task.uuid, workflow_id, &lab_uuid, &req.user_id);
    if let Err(resp) = enqueue(&state, &msg).await {
        return resp;
    }
    info!(task_uuid = %task.uuid, workflow_id, lab_uuid = %lab_uuid, "workflow run queued");
    (
        StatusCode::ACCEPTED,
        ApiResponse::ok(Accepted {
            task_uuid: task.uuid,
            action: JobAction::Start,
            job_id: None,
        }),
    )
        .into_response()
}

/// A run with its node jobs.
#[derive(Debug, Serialize)]
pub struct TaskView {
    pub task: WorkflowTask,
    pub jobs: Vec<WorkflowNodeJob>,
}

/// GET /api/v1/tasks/:task_uuid
pub async fn get_task(
    State(state): State<ApiState>,
    Path(task_uuid): Path<String>,
) -> impl IntoResponse {
    let task = match state.store.get_task(&task_uuid) {
        Ok(Some(task)) => task,
        Ok(None) => return error_response("task not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => return internal(e),
    };
    match state.store.list_node_jobs(&task_uuid) {
        Ok(jobs) => ApiResponse::ok(TaskView { task, jobs }).into_response(),
        Err(e) => internal(e),
    }
}

async fn control_task(state: ApiState, task_uuid: String, action: JobAction) -> axum::response::Response {
    let task = match state.store.get_task(&task_uuid) {
        Ok(Some(task)) => task,
        Ok(None) => return error_response("task not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => return internal(e),
    };
    let msg = JobMessage::new(action, &task.uuid, task.workflow_id, &task.lab_uuid, &task.user_id);
    if let Err(resp) = enqueue(&state, &msg).await {
        return resp;
    }
    (
        StatusCode::ACCEPTED,
        ApiResponse::ok(Accepted {
            task_uuid,
            action,
            job_id: None,
        }),
    )
        .into_response()
}

/// POST /api/v1/tasks/:task_uuid/stop
pub async fn stop_task(
    State(state): State<ApiState>,
    Path(task_uuid): Path<String>,
) -> impl IntoResponse {
    control_task(state, task_uuid, JobAction::Stop).await
}

/// POST /api/v1/tasks/:task_uuid/status
pub async fn request_status(
    State(state): State<ApiState>,
    Path(task_uuid): Path<String>,
) -> impl IntoResponse {
    control_task(state, task_uuid, JobAction::Status).await
}

// ── Device actions ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ActionSubmission {
    #[serde(default)]
    pub user_id: String,
    /// Generated when absent.
    #[serde(default)]
    pub job_id: Option<String>,
    pub device_id: String,
    pub action_name: String,
    pub action_type: String,
    #[serde(default)]
    pub action_args: Value,
}

/// POST /api/v1/labs/:lab_uuid/actions
pub async fn submit_action(
    State(state): State<ApiState>,
    Path(lab_uuid): Path<String>,
    Json(sub): Json<ActionSubmission>,
) -> impl IntoResponse {
    match state.store.get_lab(&lab_uuid) {
        Ok(Some(_)) => {}
        Ok(None) => return error_response("lab not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => return internal(e),
    }

    let task_uuid = Uuid::new_v4().to_string();
    let request = ActionRequest {
        task_uuid: task_uuid.clone(),
        lab_uuid: lab_uuid.clone(),
        user_id: sub.user_id.clone(),
        job_id: sub.job_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        device_id: sub.device_id,
        action_name: sub.action_name,
        action_type: sub.action_type,
        action_args: sub.action_args,
    };
    let missing = request.missing_fields();
    if !missing.is_empty() {
        return error_response(&format!("missing {}", missing.join(", ")), StatusCode::BAD_REQUEST)
            .into_response();
    }

    let payload = match serde_json::to_string(&request) {
        Ok(p) => p,
        Err(e) => return internal(e),
    };
    if let Err(e) = state
        .backbone
        .set_px(
            &action_request_key(&task_uuid),
            &payload,
            state.config.engine.action_request_ttl(),
        )
        .await
    {
        warn!(task_uuid = %task_uuid, error = %e, "failed to stash action request");
        return error_response("job queue unavailable", StatusCode::SERVICE_UNAVAILABLE).into_response();
    }

    let msg = JobMessage::new(JobAction::StartAction, &task_uuid, 0, &lab_uuid, &sub.user_id);
    if let Err(resp) = enqueue(&state, &msg).await {
        return resp;
    }
    info!(task_uuid = %task_uuid, lab_uuid = %lab_uuid, device_id = %request.device_id, "device action queued");
    (
        StatusCode::ACCEPTED,
        ApiResponse::ok(Accepted {
            task_uuid,
            action: JobAction::StartAction,
            job_id: Some(request.job_id),
        }),
    )
        .into_response()
}

/// GET /api/v1/actions/:task_uuid/result
pub async fn action_result(
    State(state): State<ApiState>,
    Path(task_uuid): Path<String>,
) -> impl IntoResponse {
    let raw = match state.backbone.get(&action_result_key(&task_uuid)).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return error_response("record not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => return internal(e),
    };
    match serde_json::from_str::<ActionResult>(&raw) {
        Ok(result) => ApiResponse::ok(result).into_response(),
        Err(e) => internal(e),
    }
}
