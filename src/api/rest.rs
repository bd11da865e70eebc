// =============================================================================
// REST Control Surface — Axum 0.7
// =============================================================================
//
// The minimal external handle the engine exposes: status, pending setups,
// approve/reject for copilot strategies, positions, and alerts. All endpoints
// live under `/api/v1/`.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::engine::ExecutionEngine;

// =============================================================================
// Router construction
// =============================================================================

/// Build the control API router with CORS middleware and shared state.
pub fn router(engine: Arc<ExecutionEngine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/status", get(status))
        .route("/api/v1/setups/pending", get(pending_setups))
        .route("/api/v1/setups/recent", get(recent_setups))
        .route("/api/v1/setups/:id/approve", post(approve_setup))
        .route("/api/v1/setups/:id/reject", post(reject_setup))
        .route("/api/v1/strategies/:id/resume", post(resume_strategy))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/alerts", get(alerts))
        .layer(cors)
        .with_state(engine)
}

// =============================================================================
// Handlers
// =============================================================================

async fn health(State(engine): State<Arc<ExecutionEngine>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "engine_state": engine.state(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

async fn status(State(engine): State<Arc<ExecutionEngine>>) -> impl IntoResponse {
    Json(engine.snapshot())
}

async fn pending_setups(State(engine): State<Arc<ExecutionEngine>>) -> impl IntoResponse {
    Json(engine.pending_setups())
}

async fn recent_setups(State(engine): State<Arc<ExecutionEngine>>) -> impl IntoResponse {
    Json(engine.recent_setups())
}

async fn approve_setup(
    State(engine): State<Arc<ExecutionEngine>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    info!(setup = %id, "approval requested via API");
    match engine.approve_setup(&id).await {
        Ok(setup) => (StatusCode::OK, Json(serde_json::to_value(setup).unwrap_or_default())),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

#[derive(Debug, Deserialize, Default)]
struct RejectBody {
    reason: Option<String>,
}

async fn reject_setup(
    State(engine): State<Arc<ExecutionEngine>>,
    Path(id): Path<String>,
    body: Option<Json<RejectBody>>,
) -> impl IntoResponse {
    let reason = body.and_then(|Json(b)| b.reason);
    info!(setup = %id, "rejection requested via API");
    match engine.reject_setup(&id, reason).await {
        Ok(setup) => (StatusCode::OK, Json(serde_json::to_value(setup).unwrap_or_default())),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

async fn resume_strategy(
    State(engine): State<Arc<ExecutionEngine>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match engine.resume_strategy(&id).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "resumed": id }))),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

async fn positions(State(engine): State<Arc<ExecutionEngine>>) -> impl IntoResponse {
    match engine
        .positions_manager()
        .open_positions(engine.account_id())
        .await
    {
        Ok(positions) => (
            StatusCode::OK,
            Json(serde_json::to_value(positions).unwrap_or_default()),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

async fn alerts(State(engine): State<Arc<ExecutionEngine>>) -> impl IntoResponse {
    Json(engine.recent_alerts())
}
