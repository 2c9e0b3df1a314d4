use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::Value;
use tokio::sync::watch;
use tower::ServiceExt;
use uuid::Uuid;

use batchpool::dashboard::{router, DashboardState};
use batchpool::scheduler::{JobStatus, TaskRegistry};
use batchpool::status::StatusSnapshot;
use batchpool::worker::{WorkerId, WorkerLifecycle, WorkerSlot};

/// Helper to create test state with one running and one pending job
fn create_test_state() -> (DashboardState, watch::Sender<StatusSnapshot>) {
    let mut registry = TaskRegistry::create(vec![
        "https://a.example".to_string(),
        "https://b.example".to_string(),
    ]);
    registry.set_status(0, JobStatus::InProgress).unwrap();
    registry.bind_worker(0, WorkerId(1)).unwrap();

    let mut slot = WorkerSlot::new(WorkerId(1));
    slot.lifecycle = WorkerLifecycle::Busy;
    slot.current_job = Some(0);

    let snapshot = StatusSnapshot::build(Uuid::new_v4(), registry.snapshot(), vec![slot], false);
    let (tx, rx) = watch::channel(snapshot);
    (DashboardState { status: rx }, tx)
}

async fn get_json(state: DashboardState, uri: &str) -> (StatusCode, Value) {
    let response = router(state)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn test_status_endpoint() {
    let (state, _tx) = create_test_state();

    let (status, json) = get_json(state, "/api/status").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["counts"]["total"], 2);
    assert_eq!(json["counts"]["in_progress"], 1);
    assert_eq!(json["counts"]["pending"], 1);
    assert_eq!(json["finished"], false);
    assert!(json["run_id"].is_string());
}

#[tokio::test]
async fn test_jobs_endpoint() {
    let (state, _tx) = create_test_state();

    let (status, json) = get_json(state, "/api/jobs").await;

    assert_eq!(status, StatusCode::OK);
    let jobs = json.as_array().unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0]["id"], 0);
    assert_eq!(jobs[0]["status"], "in_progress");
    assert_eq!(jobs[0]["progress"], 10);
    assert_eq!(jobs[0]["worker"], 1);
    assert_eq!(jobs[1]["status"], "pending");
    assert_eq!(jobs[1]["payload"], "https://b.example");
}

#[tokio::test]
async fn test_workers_endpoint() {
    let (state, _tx) = create_test_state();

    let (status, json) = get_json(state, "/api/workers").await;

    assert_eq!(status, StatusCode::OK);
    let workers = json.as_array().unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0]["worker_id"], 1);
    assert_eq!(workers[0]["lifecycle"], "busy");
    assert_eq!(workers[0]["current_job"], 0);
}

#[tokio::test]
async fn test_endpoints_serve_latest_snapshot() {
    let (state, tx) = create_test_state();

    let mut finished = tx.borrow().clone();
    finished.finished = true;
    finished.workers.clear();
    tx.send_replace(finished);

    let (_, json) = get_json(state.clone(), "/api/status").await;
    assert_eq!(json["finished"], true);

    let (_, json) = get_json(state, "/api/workers").await;
    assert!(json.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_route_returns_404() {
    let (state, _tx) = create_test_state();

    let (status, _) = get_json(state, "/api/nope").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}
