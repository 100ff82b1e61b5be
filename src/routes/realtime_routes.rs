use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::SyncError;
use crate::services::session::{RealtimeOptions, RealtimeSession};
use crate::services::webhook::webhook_callbacks;
use crate::state::app::AppState;
use crate::state::subscription::EventKind;

/// Build all realtime routes under /realtime
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/subscribe", post(handle_subscribe))
        .route("/unsubscribe", post(handle_unsubscribe))
        .route("/:id", get(session_info))
        .route("/:id/retry", post(handle_retry))
        .with_state(state)
}

/// Payload on /realtime/subscribe. The server picks the id.
#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub child_id: Option<String>,
    #[serde(default)]
    pub events: Option<Vec<EventKind>>,
    pub callback: String,
}

type ApiError = (StatusCode, Json<Value>);

fn bad_request(error: &SyncError) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": error.to_string() })))
}

fn not_found(id: u64) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("no subscription {id}") })),
    )
}

//
// ─────────────────────────────────────────────────────────────
// POST /realtime/subscribe
// Register a webhook subscriber for a parent or child scope
// ─────────────────────────────────────────────────────────────
//
async fn handle_subscribe(
    State(state): State<AppState>,
    Json(req): Json<SubscribeRequest>,
) -> Result<Json<Value>, ApiError> {
    if !(req.callback.starts_with("http://") || req.callback.starts_with("https://")) {
        return Err(bad_request(&SyncError::InvalidConfig(format!(
            "callback must be an http(s) URL, got {:?}",
            req.callback
        ))));
    }

    let mut options = RealtimeOptions {
        parent_id: req.parent_id,
        child_id: req.child_id,
        ..RealtimeOptions::default()
    };
    if let Some(events) = req.events {
        options.events = events;
    }

    let id = state.next_subscription_id();
    let session = RealtimeSession::new(
        state.realtime.clone(),
        format!("webhook-{id}"),
        webhook_callbacks(state.http.clone(), req.callback),
    );
    session.subscribe(&options).map_err(|e| bad_request(&e))?;

    state.sessions.write().await.insert(id, session);
    Ok(Json(json!({ "subscription_id": id })))
}

//
// ─────────────────────────────────────────────────────────────
// POST /realtime/unsubscribe
// Remove a webhook subscriber; unknown ids report `false`
// ─────────────────────────────────────────────────────────────
//
async fn handle_unsubscribe(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let id = payload
        .get("subscription_id")
        .and_then(|v| v.as_u64())
        .ok_or(StatusCode::BAD_REQUEST)?;

    // Dropping the session closes its channels.
    let existed = state.sessions.write().await.remove(&id).is_some();

    Ok(Json(json!({
        "subscription_id": id,
        "unsubscribed": existed
    })))
}

//
// ─────────────────────────────────────────────────────────────
// GET /realtime/{id}
// What a dashboard needs to draw its connection indicator
// ─────────────────────────────────────────────────────────────
//
async fn session_info(
    Path(id): Path<u64>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let sessions = state.sessions.read().await;
    let session = sessions.get(&id).ok_or_else(|| not_found(id))?;

    Ok(Json(json!({
        "subscription_id": id,
        "is_connected": session.is_connected(),
        "last_update": session.last_update(),
        "error": session.error().map(|e| e.to_string()),
        "is_healthy": state.realtime.status().is_healthy,
    })))
}

//
// ─────────────────────────────────────────────────────────────
// POST /realtime/{id}/retry
// Manual reconnect for one subscriber
// ─────────────────────────────────────────────────────────────
//
async fn handle_retry(
    Path(id): Path<u64>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let sessions = state.sessions.read().await;
    let session = sessions.get(&id).ok_or_else(|| not_found(id))?;

    Ok(Json(json!({
        "subscription_id": id,
        "retried": session.retry_connection(),
    })))
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    use super::*;
    use crate::app::build_app;
    use crate::routes::testing::test_state;

    async fn call(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn subscribe_then_feed_then_unsubscribe() {
        let (state, transport) = test_state();
        let app = build_app(state.clone());

        let (status, body) = call(
            app.clone(),
            Method::POST,
            "/realtime/subscribe",
            Some(json!({ "parent_id": "P1", "callback": "http://127.0.0.1:9/hook" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let id = body["subscription_id"].as_u64().unwrap();
        assert_eq!(transport.opened_ids().len(), 3);

        for channel in transport.opened_ids() {
            let (status, _) = call(
                app.clone(),
                Method::POST,
                &format!("/feed/{channel}"),
                Some(json!({ "type": "SUBSCRIBED" })),
            )
            .await;
            assert_eq!(status, StatusCode::ACCEPTED);
        }

        let (_, info) = call(app.clone(), Method::GET, &format!("/realtime/{id}"), None).await;
        assert_eq!(info["is_connected"], true);
        assert_eq!(info["error"], Value::Null);

        let (_, system) = call(app.clone(), Method::GET, "/system/status", None).await;
        assert_eq!(system["connection_status"], "connected");
        assert_eq!(system["active_subscriptions"], 3);

        let (_, gone) = call(
            app.clone(),
            Method::POST,
            "/realtime/unsubscribe",
            Some(json!({ "subscription_id": id })),
        )
        .await;
        assert_eq!(gone["unsubscribed"], true);
        assert_eq!(transport.closed_ids().len(), 3);

        let (_, again) = call(
            app,
            Method::POST,
            "/realtime/unsubscribe",
            Some(json!({ "subscription_id": id })),
        )
        .await;
        assert_eq!(again["unsubscribed"], false);
    }

    #[tokio::test]
    async fn bad_requests_are_rejected() {
        let (state, transport) = test_state();
        let app = build_app(state);

        let (status, body) = call(
            app.clone(),
            Method::POST,
            "/realtime/subscribe",
            Some(json!({ "parent_id": "P1", "events": [], "callback": "http://127.0.0.1:9/hook" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("Invalid subscription"));
        assert!(transport.opened_ids().is_empty());

        let (status, _) = call(
            app.clone(),
            Method::POST,
            "/realtime/subscribe",
            Some(json!({ "callback": "ftp://example" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(app.clone(), Method::POST, "/realtime/unsubscribe", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(app, Method::POST, "/realtime/42/retry", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn retry_after_channel_error() {
        let (state, transport) = test_state();
        let app = build_app(state);

        let (_, body) = call(
            app.clone(),
            Method::POST,
            "/realtime/subscribe",
            Some(json!({ "child_id": "K1", "callback": "http://127.0.0.1:9/hook" })),
        )
        .await;
        let id = body["subscription_id"].as_u64().unwrap();
        let first = transport.opened_ids()[0];

        call(
            app.clone(),
            Method::POST,
            &format!("/feed/{first}"),
            Some(json!({ "type": "CHANNEL_ERROR", "message": "socket reset" })),
        )
        .await;

        let (_, info) = call(app.clone(), Method::GET, &format!("/realtime/{id}"), None).await;
        assert!(info["error"].as_str().unwrap().contains("socket reset"));

        let (_, retried) = call(app.clone(), Method::POST, &format!("/realtime/{id}/retry"), None).await;
        // Only the failed channel is reopened; the other two are still
        // waiting on their first answer.
        assert_eq!(retried["retried"], 1);
        assert_eq!(transport.opened_ids().len(), 4);

        let (_, system) = call(app, Method::GET, "/system/status", None).await;
        assert_eq!(system["connection_status"], "reconnecting");
    }
}
