//! Seam between the realtime layer and the managed change-feed service.
//!
//! The feed talks back through an [`EventSink`] (or the `/feed/{channel}`
//! route, which ends up in the same handler). Every lifecycle or data
//! notification is one [`TransportEvent`].

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::RealtimeConfig;
use crate::errors::SyncError;
use crate::services::realtime::EventSink;
use crate::state::status::ConnectionStatus;
use crate::state::subscription::{ChangeEvent, EventKind};

/// Fresh for every (re)open, so late signals from a replaced channel can be
/// told apart from current ones.
pub type ChannelId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportEvent {
    Subscribed,
    ChannelError {
        #[serde(default)]
        message: Option<String>,
    },
    TimedOut,
    Closed,
    DataChanged { payload: ChangeEvent },
}

impl TransportEvent {
    /// Status a lifecycle signal moves the channel to; `None` for data.
    pub fn target_status(&self) -> Option<ConnectionStatus> {
        match self {
            TransportEvent::Subscribed => Some(ConnectionStatus::Connected),
            TransportEvent::ChannelError { .. } | TransportEvent::TimedOut | TransportEvent::Closed => {
                Some(ConnectionStatus::Disconnected)
            }
            TransportEvent::DataChanged { .. } => None,
        }
    }

    /// Error reported to the consumer for a failure signal on `channel`.
    pub fn failure(&self, channel: &str) -> Option<SyncError> {
        match self {
            TransportEvent::ChannelError { message } => Some(SyncError::Channel {
                channel: channel.to_string(),
                message: message.clone().unwrap_or_else(|| "unknown error".to_string()),
            }),
            TransportEvent::TimedOut => Some(SyncError::TimedOut(channel.to_string())),
            TransportEvent::Closed => Some(SyncError::Closed(channel.to_string())),
            TransportEvent::Subscribed | TransportEvent::DataChanged { .. } => None,
        }
    }
}

/// What the feed is asked to deliver on one channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSpec {
    pub channel_id: ChannelId,
    pub name: String,
    pub table: String,
    pub events: Vec<EventKind>,
    pub filter: Option<String>,
}

pub trait Transport: Send + Sync {
    /// Ask the feed to start delivering `spec`. Returns quickly; the outcome
    /// arrives later as `Subscribed` or a failure signal through `sink`.
    fn open(&self, spec: &ChannelSpec, sink: EventSink) -> Result<(), SyncError>;

    /// Best effort. Closing an unknown or already-closed channel is fine.
    fn close(&self, channel: ChannelId);
}

/// Registers channels with the feed service over HTTP. The service calls
/// back on `/feed/{channel_id}`.
pub struct HttpTransport {
    client: Client,
    upstream_url: String,
    callback_base_url: String,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(client: Client, cfg: &RealtimeConfig) -> Self {
        Self {
            client,
            upstream_url: cfg.upstream_url.trim_end_matches('/').to_string(),
            callback_base_url: cfg.callback_base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("apikey", key).bearer_auth(key),
            None => req,
        }
    }
}

impl Transport for HttpTransport {
    fn open(&self, spec: &ChannelSpec, sink: EventSink) -> Result<(), SyncError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SyncError::Transport(format!("no async runtime: {e}")))?;

        let body = json!({
            "channel_id": spec.channel_id,
            "name": spec.name,
            "table": spec.table,
            "events": spec.events,
            "filter": spec.filter,
            "callback": format!("{}/feed/{}", self.callback_base_url, spec.channel_id),
        });
        let request = self
            .authorize(self.client.post(format!("{}/channels", self.upstream_url)))
            .json(&body);
        let channel = spec.channel_id;

        runtime.spawn(async move {
            let message = match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!("Feed accepted channel {}", channel);
                    return;
                }
                Ok(resp) => format!("feed rejected channel: HTTP {}", resp.status()),
                Err(e) => format!("feed unreachable: {e}"),
            };
            sink.emit(channel, TransportEvent::ChannelError { message: Some(message) });
        });

        Ok(())
    }

    fn close(&self, channel: ChannelId) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Cannot close channel {} outside the runtime", channel);
            return;
        };

        let request = self.authorize(
            self.client.delete(format!("{}/channels/{}", self.upstream_url, channel)),
        );

        runtime.spawn(async move {
            if let Err(e) = request.send().await {
                warn!("Error closing channel {}: {}", channel, e);
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records opens and closes; fails opens on demand.
    #[derive(Default)]
    pub struct RecordingTransport {
        pub opened: Mutex<Vec<ChannelSpec>>,
        pub closed: Mutex<Vec<ChannelId>>,
        pub fail_opens: Mutex<bool>,
    }

    impl RecordingTransport {
        pub fn opened_ids(&self) -> Vec<ChannelId> {
            self.opened.lock().unwrap().iter().map(|s| s.channel_id).collect()
        }

        pub fn closed_ids(&self) -> Vec<ChannelId> {
            self.closed.lock().unwrap().clone()
        }

        pub fn last_opened(&self) -> ChannelId {
            *self.opened_ids().last().expect("no channel opened")
        }
    }

    impl Transport for RecordingTransport {
        fn open(&self, spec: &ChannelSpec, _sink: EventSink) -> Result<(), SyncError> {
            self.opened.lock().unwrap().push(spec.clone());
            if *self.fail_opens.lock().unwrap() {
                return Err(SyncError::Transport("connection refused".into()));
            }
            Ok(())
        }

        fn close(&self, channel: ChannelId) {
            self.closed.lock().unwrap().push(channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lifecycle_signals_map_to_fixed_statuses() {
        assert_eq!(TransportEvent::Subscribed.target_status(), Some(ConnectionStatus::Connected));
        for signal in [
            TransportEvent::ChannelError { message: None },
            TransportEvent::TimedOut,
            TransportEvent::Closed,
        ] {
            assert_eq!(signal.target_status(), Some(ConnectionStatus::Disconnected));
            assert!(signal.failure("chores").is_some());
        }
    }

    #[test]
    fn feed_json_decodes_into_events() {
        let error: TransportEvent =
            serde_json::from_value(json!({ "type": "CHANNEL_ERROR", "message": "boom" })).unwrap();
        assert_eq!(error, TransportEvent::ChannelError { message: Some("boom".into()) });

        let data: TransportEvent = serde_json::from_value(json!({
            "type": "DATA_CHANGED",
            "payload": { "table": "chores", "eventType": "DELETE", "old": { "id": "c1" } }
        }))
        .unwrap();
        match data {
            TransportEvent::DataChanged { payload } => {
                assert_eq!(payload.kind, EventKind::Delete);
                assert!(payload.new.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
