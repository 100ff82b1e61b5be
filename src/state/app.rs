use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use reqwest::Client;
use tokio::sync::RwLock;

use crate::config::AppConfig;
use crate::services::realtime::RealtimeContext;
use crate::services::session::RealtimeSession;

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub realtime: Arc<RealtimeContext>,
    pub http: Client,
    /// Webhook subscribers by subscription id. Dropping a session
    /// unsubscribes it.
    pub sessions: Arc<RwLock<HashMap<u64, RealtimeSession>>>,
    next_id: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(config: AppConfig, realtime: Arc<RealtimeContext>, http: Client) -> Self {
        Self {
            config,
            realtime,
            http,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn next_subscription_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}
