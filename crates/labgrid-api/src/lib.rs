//! labgrid-api: REST surface of the scheduler.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/labs` | List labs |
//! | POST | `/api/v1/labs` | Register a lab |
//! | GET | `/api/v1/labs/{lab_uuid}/devices` | Last reported device properties |
//! | POST | `/api/v1/workflows` | Store a workflow definition |
//! | POST | `/api/v1/labs/{lab_uuid}/workflows/{workflow_id}/run` | Start a workflow run |
//! | GET | `/api/v1/tasks/{task_uuid}` | Run status and node jobs |
//! | POST | `/api/v1/tasks/{task_uuid}/stop` | Stop a run |
//! | POST | `/api/v1/tasks/{task_uuid}/status` | Re-publish a run's status |
//! | POST | `/api/v1/labs/{lab_uuid}/actions` | Run one device action |
//! | GET | `/api/v1/actions/{task_uuid}/result` | Result of a device action |
//! | GET | `/api/v1/ws/schedule` | Edge controller WebSocket |
//! | GET | `/healthz` | Liveness |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use labgrid_core::SchedulerConfig;
use labgrid_edge::{Control, ControlContext, ws_router};
use labgrid_queue::{AffinityQueue, Backbone};
use labgrid_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub backbone: Arc<dyn Backbone>,
    pub queue: AffinityQueue,
    pub config: SchedulerConfig,
}

impl ApiState {
    pub fn from_context(ctx: &ControlContext) -> Self {
        Self {
            store: ctx.store.clone(),
            backbone: ctx.backbone.clone(),
            queue: ctx.affinity.clone(),
            config: ctx.config.clone(),
        }
    }
}

/// REST routes only, without the edge endpoint.
pub fn api_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/labs", get(handlers::list_labs).post(handlers::create_lab))
        .route("/labs/{lab_uuid}/devices", get(handlers::list_devices))
        .route("/workflows", post(handlers::create_workflow))
        .route(
            "/labs/{lab_uuid}/workflows/{workflow_id}/run",
            post(handlers::run_workflow),
        )
        .route("/tasks/{task_uuid}", get(handlers::get_task))
        .route("/tasks/{task_uuid}/stop", post(handlers::stop_task))
        .route("/tasks/{task_uuid}/status", post(handlers::request_status))
        .route("/labs/{lab_uuid}/actions", post(handlers::submit_action))
        .route("/actions/{task_uuid}/result", get(handlers::action_result))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}

/// Build the complete router (REST + edge WebSocket).
pub fn build_router(control: Arc<Control>) -> Router {
    let state = ApiState::from_context(control.context());
    api_router(state).merge(ws_router(control))
}
