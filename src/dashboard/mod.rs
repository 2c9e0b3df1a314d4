use std::net::SocketAddr;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::status::StatusSnapshot;

#[derive(Clone)]
pub struct DashboardState {
    pub status: watch::Receiver<StatusSnapshot>,
}

/// Read-only JSON API over the latest status snapshot.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/jobs", get(jobs_handler))
        .route("/api/workers", get(workers_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, stop: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(stop.cancelled_owned())
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let snapshot = state.status.borrow().clone();
    Json(snapshot)
}

async fn jobs_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let jobs = state.status.borrow().jobs.clone();
    Json(jobs)
}

async fn workers_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let workers = state.status.borrow().workers.clone();
    Json(workers)
}
