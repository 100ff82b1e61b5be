use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::services::connection::ChannelState;
use crate::services::router::Delivery;
use crate::services::transport::{ChannelId, ChannelSpec};
use crate::state::subscription::SubscriptionConfig;

/// A live subscription: its config, its channel and its dispatcher.
pub struct Entry {
    pub key: String,
    pub config: SubscriptionConfig,
    pub created_at: DateTime<Utc>,
    pub channel: ChannelState,
    pub queue: mpsc::UnboundedSender<Delivery>,
    pub dispatcher: JoinHandle<()>,
}

impl Entry {
    pub fn channel_spec(&self) -> ChannelSpec {
        ChannelSpec {
            channel_id: self.channel.id,
            name: self.channel.name.clone(),
            table: self.config.table.clone(),
            events: self.config.events.clone(),
            filter: self.config.filter.as_ref().map(ToString::to_string),
        }
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        // Queued deliveries are dropped with the task, releasing their
        // pending markers.
        self.dispatcher.abort();
    }
}

/// Subscriptions by key, plus the reverse index used to route channel
/// signals. At most one entry per key.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<String, Entry>,
    by_channel: HashMap<ChannelId, String>,
    next_channel: ChannelId,
    disposed: bool,
}

impl SubscriptionRegistry {
    pub fn allocate_channel_id(&mut self) -> ChannelId {
        self.next_channel += 1;
        self.next_channel
    }

    /// Installs `entry`, handing back whatever it replaced.
    pub fn insert(&mut self, entry: Entry) -> Option<Entry> {
        let old = self.remove(&entry.key);
        self.by_channel.insert(entry.channel.id, entry.key.clone());
        self.entries.insert(entry.key.clone(), entry);
        old
    }

    pub fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.by_channel.remove(&entry.channel.id);
        Some(entry)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Entry> {
        self.entries.get_mut(key)
    }

    /// Entry currently owning `channel`. Stale ids resolve to nothing.
    pub fn by_channel_mut(&mut self, channel: ChannelId) -> Option<&mut Entry> {
        let key = self.by_channel.get(&channel)?;
        self.entries.get_mut(key)
    }

    /// Points `key` at a freshly opened channel.
    pub fn rebind(&mut self, key: &str, old: ChannelId, new: ChannelId) {
        self.by_channel.remove(&old);
        self.by_channel.insert(new, key.to_string());
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Marks the registry dead and hands back every entry. `None` if it was
    /// already disposed.
    pub fn dispose(&mut self) -> Option<Vec<Entry>> {
        if self.disposed {
            return None;
        }
        self.disposed = true;
        self.by_channel.clear();
        Some(self.entries.drain().map(|(_, entry)| entry).collect())
    }
}
