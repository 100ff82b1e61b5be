use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

/// Process-wide connection status shown on the dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
        })
    }
}

/// What consumers see of the realtime layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub connection_status: ConnectionStatus,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub pending_updates: u64,
    pub is_healthy: bool,
    pub active_subscriptions: usize,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            connection_status: ConnectionStatus::Disconnected,
            last_sync_time: None,
            pending_updates: 0,
            is_healthy: true,
            active_subscriptions: 0,
        }
    }
}

/// Healthy when nothing is subscribed, or the last sync is fresher than
/// `threshold`. Subscriptions that never synced are unhealthy.
pub fn is_healthy(
    active_subscriptions: usize,
    last_sync: Option<Instant>,
    now: Instant,
    threshold: Duration,
) -> bool {
    if active_subscriptions == 0 {
        return true;
    }
    match last_sync {
        Some(at) => now.saturating_duration_since(at) < threshold,
        None => false,
    }
}
