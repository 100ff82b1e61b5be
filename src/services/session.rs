//! Consumer-facing view of the realtime layer for one dashboard.
//!
//! A session turns `{parent_id, child_id, events}` plus a handful of named
//! callbacks into one subscription per table, and answers "am I connected,
//! when did I last hear anything, what went wrong".

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::errors::SyncError;
use crate::services::realtime::RealtimeContext;
use crate::state::status::ConnectionStatus;
use crate::state::subscription::{
    ChangeCallback, ColumnFilter, ErrorCallback, EventKind, Linkage, StatusCallback, SubscriptionConfig,
};

pub const CHORES_TABLE: &str = "chores";
pub const COMPLETIONS_TABLE: &str = "chore_completions";
pub const PROFILES_TABLE: &str = "profiles";

#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeOptions {
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub child_id: Option<String>,
    #[serde(default = "all_events")]
    pub events: Vec<EventKind>,
}

fn all_events() -> Vec<EventKind> {
    EventKind::ALL.to_vec()
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self { parent_id: None, child_id: None, events: all_events() }
    }
}

impl RealtimeOptions {
    pub fn for_parent(parent_id: impl Into<String>) -> Self {
        Self { parent_id: Some(parent_id.into()), ..Self::default() }
    }

    pub fn for_child(child_id: impl Into<String>) -> Self {
        Self { child_id: Some(child_id.into()), ..Self::default() }
    }

    fn scope_key(&self) -> String {
        match (&self.parent_id, &self.child_id) {
            (Some(parent), Some(child)) => format!("parent:{parent}:child:{child}"),
            (Some(parent), None) => format!("parent:{parent}"),
            (None, Some(child)) => format!("child:{child}"),
            (None, None) => "all".to_string(),
        }
    }
}

#[derive(Clone, Default)]
pub struct RealtimeCallbacks {
    pub on_chore_update: Option<ChangeCallback>,
    pub on_chore_completion_update: Option<ChangeCallback>,
    pub on_profile_update: Option<ChangeCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_connection_change: Option<StatusCallback>,
}

/// How each table is tied to a parent and to a child.
fn table_links(table: &str) -> (Linkage, &'static str) {
    match table {
        COMPLETIONS_TABLE => (
            Linkage::Lookup {
                via: "chore_id".to_string(),
                table: CHORES_TABLE.to_string(),
                column: "parent_id".to_string(),
            },
            "child_id",
        ),
        PROFILES_TABLE => (Linkage::Column("parent_id".to_string()), "id"),
        _ => (Linkage::Column("parent_id".to_string()), "assigned_to"),
    }
}

pub struct RealtimeSession {
    ctx: Arc<RealtimeContext>,
    namespace: String,
    callbacks: RealtimeCallbacks,
    keys: Mutex<Vec<String>>,
    last_error: Arc<Mutex<Option<SyncError>>>,
}

impl RealtimeSession {
    /// `namespace` keeps sessions with the same scope from replacing each
    /// other's subscriptions.
    pub fn new(ctx: Arc<RealtimeContext>, namespace: impl Into<String>, callbacks: RealtimeCallbacks) -> Self {
        Self {
            ctx,
            namespace: namespace.into(),
            callbacks,
            keys: Mutex::new(Vec::new()),
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    fn keys(&self) -> MutexGuard<'_, Vec<String>> {
        self.keys.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_error(&self, error: Option<SyncError>) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }

    /// Replaces whatever this session was watching with `options`.
    pub fn subscribe(&self, options: &RealtimeOptions) -> Result<(), SyncError> {
        self.unsubscribe();
        self.set_error(None);

        let tables = [
            (CHORES_TABLE, &self.callbacks.on_chore_update),
            (COMPLETIONS_TABLE, &self.callbacks.on_chore_completion_update),
            (PROFILES_TABLE, &self.callbacks.on_profile_update),
        ];

        let mut added: Vec<String> = Vec::new();
        for (table, callback) in tables {
            let Some(callback) = callback else { continue };
            let key = format!("{}:{}:{}", self.namespace, table, options.scope_key());

            if let Err(e) = self.ctx.add_subscription(&key, self.config_for(table, callback.clone(), options)) {
                for key in &added {
                    self.ctx.remove_subscription(key);
                }
                self.set_error(Some(e.clone()));
                return Err(e);
            }
            added.push(key);
        }

        if added.is_empty() {
            let e = SyncError::InvalidConfig("no change callbacks registered".into());
            self.set_error(Some(e.clone()));
            return Err(e);
        }

        debug!("Session {} watching {:?}", self.namespace, added);
        *self.keys() = added;
        Ok(())
    }

    fn config_for(&self, table: &str, callback: ChangeCallback, options: &RealtimeOptions) -> SubscriptionConfig {
        let (linkage, child_column) = table_links(table);
        let mut config = SubscriptionConfig::new(table, callback).events(options.events.iter().copied());

        if let Some(child) = &options.child_id {
            config = config
                .child_scope(child.clone(), child_column)
                .filter(ColumnFilter::eq(child_column, child.clone()));
        }
        if let Some(parent) = &options.parent_id {
            if let (Linkage::Column(column), None) = (&linkage, &config.filter) {
                config = config.filter(ColumnFilter::eq(column.clone(), parent.clone()));
            }
            config = config.parent_scope(parent.clone(), linkage);
        }

        let last_error = self.last_error.clone();
        let user_on_error = self.callbacks.on_error.clone();
        config = config.on_error(Arc::new(move |e: &SyncError| {
            *last_error.lock().unwrap_or_else(|p| p.into_inner()) = Some(e.clone());
            if let Some(handler) = &user_on_error {
                handler(e);
            }
        }));

        if let Some(on_change) = &self.callbacks.on_connection_change {
            config = config.on_status(on_change.clone());
        }
        config
    }

    pub fn unsubscribe(&self) {
        let keys = std::mem::take(&mut *self.keys());
        for key in keys {
            self.ctx.remove_subscription(&key);
        }
    }

    pub fn is_subscribed(&self) -> bool {
        !self.keys().is_empty()
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.publisher().status() == ConnectionStatus::Connected
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.ctx.publisher().last_sync_time()
    }

    pub fn error(&self) -> Option<SyncError> {
        self.last_error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Manual retry of every channel this session owns. Returns how many
    /// have an attempt in flight.
    pub fn retry_connection(&self) -> usize {
        self.set_error(None);
        let keys = self.keys().clone();
        keys.iter().filter(|key| self.ctx.retry_connection(key)).count()
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value};

    use super::*;
    use crate::config::RealtimeConfig;
    use crate::services::router::testing::MapLookup;
    use crate::services::transport::testing::RecordingTransport;
    use crate::services::transport::TransportEvent;
    use crate::state::subscription::ChangeEvent;

    type Seen = Arc<Mutex<Vec<ChangeEvent>>>;

    fn recorder() -> (ChangeCallback, Seen) {
        let seen: Seen = Arc::default();
        let sink = seen.clone();
        (Arc::new(move |e: &ChangeEvent| sink.lock().unwrap().push(e.clone())), seen)
    }

    fn context(lookup: MapLookup) -> (Arc<RealtimeContext>, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let ctx = RealtimeContext::create(&RealtimeConfig::default(), transport.clone(), Arc::new(lookup));
        (ctx, transport)
    }

    fn data(table: &str, row: Value) -> TransportEvent {
        TransportEvent::DataChanged {
            payload: ChangeEvent::insert(table, row.as_object().cloned().unwrap()),
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn parent_dashboard_sees_own_chores_only() {
        let (ctx, transport) = context(MapLookup::default());
        let (on_chore, chores) = recorder();
        let session = RealtimeSession::new(
            ctx.clone(),
            "dashboard",
            RealtimeCallbacks { on_chore_update: Some(on_chore), ..RealtimeCallbacks::default() },
        );

        session.subscribe(&RealtimeOptions::for_parent("P1")).unwrap();
        let channel = transport.last_opened();
        assert_eq!(transport.opened.lock().unwrap()[0].filter.as_deref(), Some("parent_id=eq.P1"));

        ctx.handle_transport_event(channel, TransportEvent::Subscribed);
        assert!(session.is_connected());
        assert!(session.last_update().is_some());

        ctx.handle_transport_event(channel, data("chores", json!({ "id": "c1", "parent_id": "P1" })));
        ctx.handle_transport_event(channel, data("chores", json!({ "id": "c2", "parent_id": "P2" })));
        settle().await;

        let seen = chores.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, EventKind::Insert);
    }

    #[tokio::test(start_paused = true)]
    async fn completions_are_matched_through_their_chore() {
        let lookup = MapLookup::default().with_row("chores", "c1", "P1").with_row("chores", "c2", "P2");
        let (ctx, transport) = context(lookup);
        let (on_completion, completions) = recorder();
        let session = RealtimeSession::new(
            ctx.clone(),
            "dashboard",
            RealtimeCallbacks { on_chore_completion_update: Some(on_completion), ..RealtimeCallbacks::default() },
        );

        session.subscribe(&RealtimeOptions::for_parent("P1")).unwrap();
        let spec = transport.opened.lock().unwrap()[0].clone();
        assert_eq!(spec.table, COMPLETIONS_TABLE);
        assert_eq!(spec.filter, None);

        ctx.handle_transport_event(spec.channel_id, data(COMPLETIONS_TABLE, json!({ "id": "k1", "chore_id": "c1" })));
        ctx.handle_transport_event(spec.channel_id, data(COMPLETIONS_TABLE, json!({ "id": "k2", "chore_id": "c2" })));
        settle().await;

        let seen = completions.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].column("id").as_deref(), Some("k1"));
    }

    #[tokio::test(start_paused = true)]
    async fn child_scope_filters_on_child_column() {
        let (ctx, transport) = context(MapLookup::default());
        let (on_profile, profiles) = recorder();
        let session = RealtimeSession::new(
            ctx.clone(),
            "kid",
            RealtimeCallbacks { on_profile_update: Some(on_profile), ..RealtimeCallbacks::default() },
        );

        session.subscribe(&RealtimeOptions::for_child("K1")).unwrap();
        let spec = transport.opened.lock().unwrap()[0].clone();
        assert_eq!(spec.filter.as_deref(), Some("id=eq.K1"));

        ctx.handle_transport_event(spec.channel_id, data(PROFILES_TABLE, json!({ "id": "K1", "points": 40 })));
        ctx.handle_transport_event(spec.channel_id, data(PROFILES_TABLE, json!({ "id": "K2", "points": 10 })));
        settle().await;

        assert_eq!(profiles.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_before_subscribed_is_quiet() {
        let (ctx, transport) = context(MapLookup::default());
        let (on_chore, _) = recorder();
        let session = RealtimeSession::new(
            ctx.clone(),
            "dashboard",
            RealtimeCallbacks { on_chore_update: Some(on_chore), ..RealtimeCallbacks::default() },
        );

        session.subscribe(&RealtimeOptions::for_parent("P1")).unwrap();
        let channel = transport.last_opened();
        session.unsubscribe();
        ctx.handle_transport_event(channel, TransportEvent::Subscribed);

        assert!(!session.is_connected());
        assert!(!session.is_subscribed());
        assert!(session.error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn errors_surface_and_retry_clears_them() {
        let (ctx, transport) = context(MapLookup::default());
        let (on_chore, _) = recorder();
        let statuses: Arc<Mutex<Vec<ConnectionStatus>>> = Arc::default();
        let status_sink = statuses.clone();
        let session = RealtimeSession::new(
            ctx.clone(),
            "dashboard",
            RealtimeCallbacks {
                on_chore_update: Some(on_chore),
                on_connection_change: Some(Arc::new(move |s: ConnectionStatus| status_sink.lock().unwrap().push(s))),
                ..RealtimeCallbacks::default()
            },
        );

        session.subscribe(&RealtimeOptions::for_parent("P1")).unwrap();
        let channel = transport.last_opened();
        ctx.handle_transport_event(channel, TransportEvent::ChannelError { message: Some("boom".into()) });

        assert!(matches!(session.error(), Some(SyncError::Channel { .. })));
        assert_eq!(session.retry_connection(), 1);
        assert!(session.error().is_none());
        assert_eq!(transport.opened_ids().len(), 2);

        // The manual retry replaced the pending timer.
        tokio::time::advance(Duration::from_secs(6)).await;
        settle().await;
        assert_eq!(transport.opened_ids().len(), 2);

        assert_eq!(
            *statuses.lock().unwrap(),
            vec![ConnectionStatus::Disconnected, ConnectionStatus::Reconnecting]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn session_without_callbacks_is_rejected() {
        let (ctx, _) = context(MapLookup::default());
        let session = RealtimeSession::new(ctx, "empty", RealtimeCallbacks::default());
        assert!(matches!(
            session.subscribe(&RealtimeOptions::default()),
            Err(SyncError::InvalidConfig(_))
        ));
        assert!(session.error().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_session_unsubscribes() {
        let (ctx, transport) = context(MapLookup::default());
        let (on_chore, _) = recorder();
        let (on_profile, _) = recorder();
        let session = RealtimeSession::new(
            ctx.clone(),
            "dashboard",
            RealtimeCallbacks {
                on_chore_update: Some(on_chore),
                on_profile_update: Some(on_profile),
                ..RealtimeCallbacks::default()
            },
        );
        session.subscribe(&RealtimeOptions::for_parent("P1")).unwrap();
        assert_eq!(ctx.subscription_keys().len(), 2);

        drop(session);
        assert!(ctx.subscription_keys().is_empty());
        assert_eq!(transport.closed_ids().len(), 2);
    }
}
