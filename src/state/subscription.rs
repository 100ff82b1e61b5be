use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::errors::SyncError;
use crate::state::status::ConnectionStatus;

/// A row snapshot as delivered by the change feed.
pub type Row = Map<String, Value>;

pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&SyncError) + Send + Sync>;
pub type StatusCallback = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Insert, EventKind::Update, EventKind::Delete];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Insert => "INSERT",
            EventKind::Update => "UPDATE",
            EventKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed mutation. Consumed once by the router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,

    #[serde(rename = "eventType")]
    pub kind: EventKind,

    /// Absent on delete.
    #[serde(default, deserialize_with = "empty_row_as_none")]
    pub new: Option<Row>,

    /// Absent on insert. The feed sends `{}` there; that is read as absent too.
    #[serde(default, deserialize_with = "empty_row_as_none")]
    pub old: Option<Row>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_timestamp: Option<DateTime<Utc>>,
}

fn empty_row_as_none<'de, D>(deserializer: D) -> Result<Option<Row>, D::Error>
where
    D: Deserializer<'de>,
{
    let row = Option::<Row>::deserialize(deserializer)?;
    Ok(row.filter(|r| !r.is_empty()))
}

impl ChangeEvent {
    pub fn insert(table: impl Into<String>, new: Row) -> Self {
        Self { table: table.into(), kind: EventKind::Insert, new: Some(new), old: None, commit_timestamp: None }
    }

    pub fn update(table: impl Into<String>, new: Row, old: Option<Row>) -> Self {
        Self { table: table.into(), kind: EventKind::Update, new: Some(new), old, commit_timestamp: None }
    }

    pub fn delete(table: impl Into<String>, old: Option<Row>) -> Self {
        Self { table: table.into(), kind: EventKind::Delete, new: None, old, commit_timestamp: None }
    }

    /// String value of `column`, preferring the new row over the old one.
    pub fn column(&self, column: &str) -> Option<String> {
        self.new
            .as_ref()
            .and_then(|row| row_value(row, column))
            .or_else(|| self.old.as_ref().and_then(|row| row_value(row, column)))
    }

    /// True if either snapshot carries `column == expected`.
    pub fn either_row_matches(&self, column: &str, expected: &str) -> bool {
        [self.new.as_ref(), self.old.as_ref()]
            .into_iter()
            .flatten()
            .any(|row| row_value(row, column).as_deref() == Some(expected))
    }
}

fn row_value(row: &Row, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparator {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl Comparator {
    fn as_str(self) -> &'static str {
        match self {
            Comparator::Eq => "eq",
            Comparator::Neq => "neq",
            Comparator::Lt => "lt",
            Comparator::Lte => "lte",
            Comparator::Gt => "gt",
            Comparator::Gte => "gte",
        }
    }
}

/// Server-side row filter forwarded to the change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnFilter {
    pub column: String,
    pub op: Comparator,
    pub value: String,
}

impl ColumnFilter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self { column: column.into(), op: Comparator::Eq, value: value.into() }
    }
}

impl fmt::Display for ColumnFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}.{}", self.column, self.op.as_str(), self.value)
    }
}

/// How a row is tied to its owning parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Linkage {
    /// The row carries the parent id directly.
    Column(String),
    /// The row references another row that carries it, e.g. a completion's
    /// `chore_id` pointing at `chores.parent_id`.
    Lookup { via: String, table: String, column: String },
}

impl Default for Linkage {
    fn default() -> Self {
        Linkage::Column("parent_id".to_string())
    }
}

/// Everything `add_subscription` needs to register interest in a table.
#[derive(Clone)]
pub struct SubscriptionConfig {
    pub table: String,
    pub events: Vec<EventKind>,
    pub filter: Option<ColumnFilter>,
    pub parent_scope: Option<String>,
    pub parent_linkage: Linkage,
    pub child_scope: Option<String>,
    pub child_column: String,
    pub callback: ChangeCallback,
    pub on_error: Option<ErrorCallback>,
    pub on_status: Option<StatusCallback>,
}

impl SubscriptionConfig {
    /// All event kinds, no scope, no filter.
    pub fn new(table: impl Into<String>, callback: ChangeCallback) -> Self {
        Self {
            table: table.into(),
            events: EventKind::ALL.to_vec(),
            filter: None,
            parent_scope: None,
            parent_linkage: Linkage::default(),
            child_scope: None,
            child_column: "child_id".to_string(),
            callback,
            on_error: None,
            on_status: None,
        }
    }

    pub fn events(mut self, events: impl IntoIterator<Item = EventKind>) -> Self {
        let mut kinds: Vec<EventKind> = Vec::new();
        for kind in events {
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        self.events = kinds;
        self
    }

    pub fn filter(mut self, filter: ColumnFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn parent_scope(mut self, parent_id: impl Into<String>, linkage: Linkage) -> Self {
        self.parent_scope = Some(parent_id.into());
        self.parent_linkage = linkage;
        self
    }

    pub fn child_scope(mut self, child_id: impl Into<String>, column: impl Into<String>) -> Self {
        self.child_scope = Some(child_id.into());
        self.child_column = column.into();
        self
    }

    pub fn on_error(mut self, handler: ErrorCallback) -> Self {
        self.on_error = Some(handler);
        self
    }

    pub fn on_status(mut self, handler: StatusCallback) -> Self {
        self.on_status = Some(handler);
        self
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.table.trim().is_empty() {
            return Err(SyncError::InvalidConfig("table name is required".into()));
        }
        if self.events.is_empty() {
            return Err(SyncError::InvalidConfig(format!(
                "no event kinds requested for table {}",
                self.table
            )));
        }
        if let Some(filter) = &self.filter {
            if filter.column.trim().is_empty() {
                return Err(SyncError::InvalidConfig("filter column is required".into()));
            }
        }
        if matches!(&self.parent_scope, Some(p) if p.is_empty())
            || matches!(&self.child_scope, Some(c) if c.is_empty())
        {
            return Err(SyncError::InvalidConfig("scope id must not be empty".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for SubscriptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionConfig")
            .field("table", &self.table)
            .field("events", &self.events)
            .field("filter", &self.filter)
            .field("parent_scope", &self.parent_scope)
            .field("parent_linkage", &self.parent_linkage)
            .field("child_scope", &self.child_scope)
            .field("child_column", &self.child_column)
            .finish_non_exhaustive()
    }
}
