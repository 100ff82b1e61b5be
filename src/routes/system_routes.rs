use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::state::app::AppState;
use crate::state::status::StatusSnapshot;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/alive", get(is_alive))
        .route("/version", get(version))
        .route("/status", get(status))
        .route("/reconnect", post(reconnect))
        .with_state(state)
}

/// GET /system/alive
async fn is_alive() -> &'static str {
    "OK"
}

/// GET /system/version
async fn version(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "version": state.config.server_version
    }))
}

/// GET /system/status
async fn status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.realtime.status())
}

/// POST /system/reconnect
/// Manual retry for every channel that is not connected.
async fn reconnect(State(state): State<AppState>) -> Json<serde_json::Value> {
    let retried = state.realtime.reconnect();
    Json(json!({
        "retried": retried,
        "status": state.realtime.status(),
    }))
}
