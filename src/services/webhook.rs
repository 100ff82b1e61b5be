use std::sync::Arc;

use chrono::Utc;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::warn;

use crate::errors::SyncError;
use crate::services::session::RealtimeCallbacks;
use crate::state::status::ConnectionStatus;
use crate::state::subscription::{ChangeCallback, ChangeEvent};

/// Session callbacks that forward everything to an HTTP subscriber.
pub fn webhook_callbacks(client: Client, url: String) -> RealtimeCallbacks {
    let on_change = |client: &Client, url: &str| -> ChangeCallback {
        let client = client.clone();
        let url = url.to_string();
        Arc::new(move |event: &ChangeEvent| send(&client, &url, change_body(event)))
    };

    let error_client = client.clone();
    let error_url = url.clone();
    let status_client = client.clone();
    let status_url = url.clone();

    RealtimeCallbacks {
        on_chore_update: Some(on_change(&client, &url)),
        on_chore_completion_update: Some(on_change(&client, &url)),
        on_profile_update: Some(on_change(&client, &url)),
        on_error: Some(Arc::new(move |e: &SyncError| {
            send(&error_client, &error_url, error_body(e));
        })),
        on_connection_change: Some(Arc::new(move |status: ConnectionStatus| {
            send(&status_client, &status_url, status_body(status));
        })),
    }
}

pub fn change_body(event: &ChangeEvent) -> Value {
    json!({
        "table": event.table,
        "event": event.kind,
        "old_value": event.old,
        "new_value": event.new,
        "timestamp": Utc::now().to_rfc3339(),
    })
}

fn error_body(error: &SyncError) -> Value {
    json!({
        "event": "error",
        "message": error.to_string(),
        "manual_retry_required": matches!(error, SyncError::ReconnectExhausted { .. }),
        "timestamp": Utc::now().to_rfc3339(),
    })
}

fn status_body(status: ConnectionStatus) -> Value {
    json!({
        "event": "connection",
        "status": status,
        "timestamp": Utc::now().to_rfc3339(),
    })
}

/// Fire and forget. Delivery failures are logged, never retried.
fn send(client: &Client, url: &str, body: Value) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!("No runtime to deliver webhook to {}", url);
        return;
    };

    let client = client.clone();
    let url = url.to_string();
    runtime.spawn(async move {
        if let Err(e) = client.post(&url).json(&body).send().await {
            warn!("Error sending webhook to {}: {}", url, e);
        }
    });
}
