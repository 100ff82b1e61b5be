use serde::Deserialize;
use std::time::Duration;
use std::{fmt, fs, path::Path};

use crate::errors::SyncError;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// HTTP port to listen on.
    pub port: u16,

    /// Log level for tracing (e.g. "info", "debug").
    pub log_level: String,

    pub server_version: String,

    /// Change-feed and reconnect tuning.
    #[serde(default)]
    pub realtime: RealtimeConfig,
}

#[derive(Deserialize, Clone)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Base URL of the managed change-feed service.
    pub upstream_url: String,

    /// Base URL of the row store REST API, used for ownership lookups.
    pub rest_url: String,

    /// Sent as `apikey` and bearer token to both upstream services.
    pub api_key: Option<String>,

    /// Public base URL of this server; the feed service posts channel
    /// events to `{callback_base_url}/feed/{channel_id}`.
    pub callback_base_url: String,

    /// A sync older than this marks the layer unhealthy.
    pub health_threshold_secs: u64,

    /// Period of the health recomputation tick.
    pub health_tick_secs: u64,

    /// Delay before the first reconnect after an unexpected failure.
    pub reconnect_delay_secs: u64,

    /// An open the feed has not answered within this long counts as timed out.
    pub subscribe_timeout_secs: u64,

    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            upstream_url: "http://127.0.0.1:54321/realtime/v1".to_string(),
            rest_url: "http://127.0.0.1:54321/rest/v1".to_string(),
            api_key: None,
            callback_base_url: "http://127.0.0.1:8088".to_string(),
            health_threshold_secs: 30,
            health_tick_secs: 5,
            reconnect_delay_secs: 5,
            subscribe_timeout_secs: 10,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            max_reconnect_attempts: 5,
        }
    }
}

impl fmt::Debug for RealtimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeConfig")
            .field("upstream_url", &self.upstream_url)
            .field("rest_url", &self.rest_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("callback_base_url", &self.callback_base_url)
            .field("health_threshold_secs", &self.health_threshold_secs)
            .field("health_tick_secs", &self.health_tick_secs)
            .field("reconnect_delay_secs", &self.reconnect_delay_secs)
            .field("subscribe_timeout_secs", &self.subscribe_timeout_secs)
            .field("backoff_base_ms", &self.backoff_base_ms)
            .field("backoff_max_ms", &self.backoff_max_ms)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .finish()
    }
}

impl RealtimeConfig {
    pub fn health_threshold(&self) -> Duration {
        Duration::from_secs(self.health_threshold_secs)
    }

    pub fn health_tick(&self) -> Duration {
        // A zero period would make `tokio::time::interval` panic.
        Duration::from_secs(self.health_tick_secs.max(1))
    }
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, SyncError> {
        let file = fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("cannot read {}: {e}", path.display())))?;

        Self::from_json(&file)
    }

    pub fn from_json(text: &str) -> Result<Self, SyncError> {
        serde_json::from_str::<AppConfig>(text)
            .map_err(|e| SyncError::Config(format!("invalid config.json: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realtime_section_is_optional() {
        let cfg = AppConfig::from_json(
            r#"{ "port": 9000, "log_level": "debug", "server_version": "1.2.3" }"#,
        )
        .unwrap();

        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.realtime.health_threshold(), Duration::from_secs(30));
        assert_eq!(cfg.realtime.health_tick(), Duration::from_secs(5));
        assert_eq!(cfg.realtime.max_reconnect_attempts, 5);
    }

    #[test]
    fn partial_realtime_section_keeps_defaults() {
        let cfg = AppConfig::from_json(
            r#"{
                "port": 9000,
                "log_level": "info",
                "server_version": "1.2.3",
                "realtime": { "reconnect_delay_secs": 2, "health_tick_secs": 0 }
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.realtime.reconnect_delay_secs, 2);
        assert_eq!(cfg.realtime.backoff_max_ms, 30_000);
        assert_eq!(cfg.realtime.health_tick(), Duration::from_secs(1));
    }

    #[test]
    fn api_key_never_reaches_debug_output() {
        let cfg = AppConfig::from_json(
            r#"{
                "port": 9000,
                "log_level": "info",
                "server_version": "1.2.3",
                "realtime": { "api_key": "service-role-secret" }
            }"#,
        )
        .unwrap();

        let printed = format!("{:?}", cfg);
        assert!(!printed.contains("service-role-secret"));
        assert!(printed.contains("<redacted>"));
        assert_eq!(cfg.realtime.api_key.as_deref(), Some("service-role-secret"));
        assert_eq!(cfg.realtime.subscribe_timeout_secs, 10);
    }

    #[test]
    fn malformed_config_is_an_error() {
        let err = AppConfig::from_json(r#"{ "port": "nope" }"#).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }
}
