//! Health, liveness, and readiness endpoint handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::network::ReadinessState;

/// Process is up. Never consults dependencies.
pub async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Kubernetes liveness probe -- always returns 200 OK.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe: 200 while serving, 503 once the gate starts draining so
/// load balancers stop routing here before the listener closes.
pub async fn readiness_handler(
    State(state): State<AppState>,
) -> (StatusCode, Json<serde_json::Value>) {
    let readiness = state.readiness.state();
    let status = match readiness {
        ReadinessState::Serving => StatusCode::OK,
        ReadinessState::Draining => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(json!({ "status": readiness.as_str() })))
}
