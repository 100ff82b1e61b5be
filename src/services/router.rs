//! Decides which change events reach which callbacks.
//!
//! Each subscription gets one dispatcher task fed by an unbounded queue, so
//! its callbacks run in feed order even when an event needs an ownership
//! lookup first.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;

use reqwest::Client;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::config::RealtimeConfig;
use crate::errors::SyncError;
use crate::services::publisher::{PendingGuard, StatusPublisher};
use crate::state::subscription::{ChangeCallback, ChangeEvent, EventKind, Linkage, SubscriptionConfig};

pub type LookupFuture<'a> = Pin<Box<dyn Future<Output = Result<Option<String>, SyncError>> + Send + 'a>>;

/// Reads one column of one row from the row store.
pub trait OwnershipLookup: Send + Sync {
    /// `Ok(None)` when the row (or the column) does not exist.
    fn lookup<'a>(&'a self, table: &'a str, id: &'a str, column: &'a str) -> LookupFuture<'a>;
}

/// The filtering half of a subscription, owned by its dispatcher.
#[derive(Clone)]
pub struct Route {
    pub key: String,
    pub table: String,
    pub events: Vec<EventKind>,
    pub parent_scope: Option<String>,
    pub parent_linkage: Linkage,
    pub child_scope: Option<String>,
    pub child_column: String,
    pub callback: ChangeCallback,
}

impl Route {
    pub fn new(key: &str, config: &SubscriptionConfig) -> Self {
        Self {
            key: key.to_string(),
            table: config.table.clone(),
            events: config.events.clone(),
            parent_scope: config.parent_scope.clone(),
            parent_linkage: config.parent_linkage.clone(),
            child_scope: config.child_scope.clone(),
            child_column: config.child_column.clone(),
            callback: config.callback.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Dispatch,
    Drop(&'static str),
    /// Ownership can only be settled by reading `table.column` of row `id`.
    Lookup { table: String, id: String, column: String, expected: String },
}

pub fn evaluate(route: &Route, event: &ChangeEvent) -> Verdict {
    if event.table != route.table {
        return Verdict::Drop("other table");
    }
    if !route.events.contains(&event.kind) {
        return Verdict::Drop("event kind not requested");
    }

    if let Some(child) = &route.child_scope {
        if !event.either_row_matches(&route.child_column, child) {
            return Verdict::Drop("child scope mismatch");
        }
    }

    let Some(parent) = &route.parent_scope else {
        return Verdict::Dispatch;
    };

    let linkage_column = match &route.parent_linkage {
        Linkage::Column(column) => column,
        Linkage::Lookup { via, .. } => via,
    };

    // A deleted row often arrives with only its primary key, so ownership
    // cannot be checked. Deletes are let through rather than hidden.
    let Some(linked) = event.column(linkage_column) else {
        return if event.kind == EventKind::Delete {
            Verdict::Dispatch
        } else {
            Verdict::Drop("row lacks parent linkage")
        };
    };

    match &route.parent_linkage {
        Linkage::Column(_) if &linked == parent => Verdict::Dispatch,
        Linkage::Column(_) => Verdict::Drop("parent scope mismatch"),
        Linkage::Lookup { table, column, .. } => Verdict::Lookup {
            table: table.clone(),
            id: linked,
            column: column.clone(),
            expected: parent.clone(),
        },
    }
}

pub struct EventRouter {
    lookup: Arc<dyn OwnershipLookup>,
    publisher: Arc<StatusPublisher>,
}

impl EventRouter {
    pub fn new(lookup: Arc<dyn OwnershipLookup>, publisher: Arc<StatusPublisher>) -> Self {
        Self { lookup, publisher }
    }

    /// Filters one event and runs the callback if it matches.
    /// Returns whether the callback ran.
    pub async fn deliver(&self, route: &Route, event: &ChangeEvent) -> bool {
        let matched = match evaluate(route, event) {
            Verdict::Dispatch => true,
            Verdict::Drop(reason) => {
                trace!(key = %route.key, table = %event.table, "Dropped {} event: {}", event.kind, reason);
                false
            }
            Verdict::Lookup { table, id, column, expected } => {
                match self.lookup.lookup(&table, &id, &column).await {
                    Ok(owner) => owner.as_deref() == Some(expected.as_str()),
                    Err(e) => {
                        warn!(key = %route.key, "Dropped {} event after failed lookup: {}", event.kind, e);
                        false
                    }
                }
            }
        };

        if !matched {
            return false;
        }

        match catch_unwind(AssertUnwindSafe(|| (route.callback)(event))) {
            Ok(()) => {
                self.publisher.mark_synced();
                true
            }
            Err(_) => {
                error!(key = %route.key, "Change callback panicked on {} event", event.kind);
                false
            }
        }
    }
}

/// One queued notification plus its in-flight marker.
pub struct Delivery {
    pub event: ChangeEvent,
    pub pending: PendingGuard,
}

pub fn spawn_dispatcher(
    router: Arc<EventRouter>,
    route: Route,
) -> (mpsc::UnboundedSender<Delivery>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();

    let task = tokio::spawn(async move {
        while let Some(delivery) = rx.recv().await {
            router.deliver(&route, &delivery.event).await;
            drop(delivery.pending);
        }
        debug!(key = %route.key, "Dispatcher finished");
    });

    (tx, task)
}

/// Ownership lookups against the row store's REST interface.
pub struct RestOwnershipLookup {
    client: Client,
    rest_url: String,
    api_key: Option<String>,
}

impl RestOwnershipLookup {
    pub fn new(client: Client, cfg: &RealtimeConfig) -> Self {
        Self {
            client,
            rest_url: cfg.rest_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
        }
    }

    async fn fetch(&self, table: &str, id: &str, column: &str) -> Result<Option<String>, SyncError> {
        let mut request = self
            .client
            .get(format!("{}/{}", self.rest_url, table))
            .query(&[("select", column.to_string()), ("id", format!("eq.{id}"))]);
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key).bearer_auth(key);
        }

        let resp = request.send().await.map_err(|e| SyncError::Lookup(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(SyncError::Lookup(format!("{table} lookup returned HTTP {}", resp.status())));
        }

        let rows: Vec<Map<String, Value>> =
            resp.json().await.map_err(|e| SyncError::Lookup(e.to_string()))?;

        Ok(rows.first().and_then(|row| match row.get(column) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        }))
    }
}

impl OwnershipLookup for RestOwnershipLookup {
    fn lookup<'a>(&'a self, table: &'a str, id: &'a str, column: &'a str) -> LookupFuture<'a> {
        Box::pin(self.fetch(table, id, column))
    }
}
