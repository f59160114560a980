//! Router regression tests.
//!
//! Drives the assembled router (REST + edge endpoint) the way `labd serve`
//! builds it, backed by an in-memory store and backbone.

use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use labgrid_api::build_router;
use labgrid_core::SchedulerConfig;
use labgrid_edge::{Control, ControlContext};
use labgrid_queue::MemoryBackbone;
use labgrid_state::StateStore;

fn test_control() -> Arc<Control> {
    let store = StateStore::open_in_memory().unwrap();
    let ctx = ControlContext::new(
        store,
        Arc::new(MemoryBackbone::new()),
        "pod-test",
        SchedulerConfig::default(),
    );
    Control::new(ctx)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn lab_body() -> Value {
    json!({
        "id": 1, "uuid": "lab-a", "name": "bench",
        "access_key": "ak", "access_secret": "sk",
        "user_id": "user-1", "status": "offline", "updated_at": 0
    })
}

fn workflow_body() -> Value {
    json!({
        "workflow": {"id": 7, "lab_id": 1, "name": "wf", "created_at": 0},
        "nodes": [
            {"uuid": "a", "workflow_id": 7, "kind": "action", "device_id": "d1",
             "action_name": "run", "action_type": "Generic"},
            {"uuid": "b", "workflow_id": 7, "kind": "action", "device_id": "d2",
             "action_name": "run", "action_type": "Generic"}
        ],
        "edges": [{"workflow_id": 7, "source": "a", "target": "b"}]
    })
}

#[tokio::test]
async fn healthz_is_ok() {
    let router = build_router(test_control());
    let resp = router.oneshot(get("/healthz")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn register_lab_and_list_it() {
    let router = build_router(test_control());

    let resp = router
        .clone()
        .oneshot(post_json("/api/v1/labs", lab_body()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = router.oneshot(get("/api/v1/labs")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"][0]["uuid"], json!("lab-a"));
}

#[tokio::test]
async fn run_workflow_then_read_the_task() {
    let router = build_router(test_control());
    router
        .clone()
        .oneshot(post_json("/api/v1/labs", lab_body()))
        .await
        .unwrap();
    let resp = router
        .clone()
        .oneshot(post_json("/api/v1/workflows", workflow_body()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = router
        .clone()
        .oneshot(post_json("/api/v1/labs/lab-a/workflows/7/run", json!({"user_id": "user-1"})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let body = body_json(resp).await;
    let task_uuid = body["data"]["task_uuid"].as_str().unwrap().to_string();

    let resp = router
        .oneshot(get(&format!("/api/v1/tasks/{task_uuid}")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["data"]["task"]["status"], json!("pending"));
    assert_eq!(body["data"]["jobs"], json!([]));
}

#[tokio::test]
async fn unknown_task_and_missing_action_result_are_404() {
    let router = build_router(test_control());

    let resp = router.clone().oneshot(get("/api/v1/tasks/nope")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = router
        .oneshot(get("/api/v1/actions/nope/result"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body = body_json(resp).await;
    assert_eq!(body["error"], json!("record not found"));
}
