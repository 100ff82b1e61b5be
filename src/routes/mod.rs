pub mod feed_routes;
pub mod realtime_routes;
pub mod system_routes;

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use reqwest::Client;

    use crate::config::AppConfig;
    use crate::services::realtime::RealtimeContext;
    use crate::services::router::testing::MapLookup;
    use crate::services::transport::testing::RecordingTransport;
    use crate::state::app::AppState;

    pub fn test_state() -> (AppState, Arc<RecordingTransport>) {
        let config = AppConfig::from_json(
            r#"{ "port": 0, "log_level": "info", "server_version": "9.9.9-test" }"#,
        )
        .unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let realtime = RealtimeContext::create(
            &config.realtime,
            transport.clone(),
            Arc::new(MapLookup::default()),
        );
        (AppState::new(config, realtime, Client::new()), transport)
    }
}
