//! Health and metrics endpoints
//!
//! Read-only views over the runtime's counters. Liveness plus the active
//! job count on `/health`, the full snapshot on `/metrics`.

use axum::{Json, Router, extract::State, routing::get};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::stats::{StatsSnapshot, WorkerStats};

/// State shared with the handlers
pub struct HealthState {
    pub worker_id: String,
    pub stats: Arc<WorkerStats>,
}

impl HealthState {
    pub fn new(worker_id: String, stats: Arc<WorkerStats>) -> Self {
        Self { worker_id, stats }
    }
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health
async fn health_check(State(state): State<Arc<HealthState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "worker_id": state.worker_id,
        "active_jobs": state.stats.active_jobs(),
    }))
}

/// GET /metrics
async fn metrics(State(state): State<Arc<HealthState>>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot())
}

/// Serves the endpoints until the shutdown token fires.
pub async fn serve(
    addr: String,
    state: Arc<HealthState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("health endpoints listening on {addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
