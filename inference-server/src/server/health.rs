//! Health check endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /health - liveness plus which predictor is loaded.
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "server": state.config.server.name,
            "predictor": state.predictor.name(),
            "session_active": state.has_active_session().await,
            "started_at": state.started_at,
        })),
    )
}
