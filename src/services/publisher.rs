use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::state::status::{is_healthy, ConnectionStatus, StatusSnapshot};

#[derive(Debug, Default)]
struct PublisherState {
    status: ConnectionStatus,
    last_sync: Option<Instant>,
    last_sync_at: Option<DateTime<Utc>>,
    active_subscriptions: usize,
}

/// Aggregated connection health for every consumer of the realtime layer.
pub struct StatusPublisher {
    state: Mutex<PublisherState>,
    pending: AtomicU64,
    threshold: Duration,
    tx: watch::Sender<StatusSnapshot>,
}

impl StatusPublisher {
    pub fn new(threshold: Duration) -> Self {
        let (tx, _) = watch::channel(StatusSnapshot::default());
        Self {
            state: Mutex::new(PublisherState::default()),
            pending: AtomicU64::new(0),
            threshold,
            tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PublisherState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Receives a new snapshot after every change.
    pub fn watch(&self) -> watch::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.build_snapshot(&self.lock())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lock().status
    }

    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        self.lock().last_sync_at
    }

    pub fn pending_updates(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    /// Last writer wins: the global status follows the most recent
    /// transport signal across all channels.
    pub fn set_status(&self, status: ConnectionStatus) {
        {
            let mut state = self.lock();
            if state.status != status {
                info!("Realtime status {} -> {}", state.status, status);
            }
            state.status = status;
            if status == ConnectionStatus::Connected {
                stamp_sync(&mut state);
            }
        }
        self.recompute();
    }

    pub fn set_active_subscriptions(&self, count: usize) {
        self.lock().active_subscriptions = count;
        self.recompute();
    }

    /// Called after a change event reached its callback.
    pub fn mark_synced(&self) {
        stamp_sync(&mut self.lock());
        self.recompute();
    }

    /// Counts one raw notification as in flight until the guard drops.
    pub fn begin_update(self: &Arc<Self>) -> PendingGuard {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.recompute();
        PendingGuard { publisher: Arc::downgrade(self) }
    }

    /// Decrements the in-flight counter, never below zero.
    pub fn finish_update(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
        self.recompute();
    }

    /// Rebuilds the snapshot and notifies watchers if anything moved.
    pub fn recompute(&self) {
        let snapshot = self.snapshot();
        self.tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn build_snapshot(&self, state: &PublisherState) -> StatusSnapshot {
        StatusSnapshot {
            connection_status: state.status,
            last_sync_time: state.last_sync_at,
            pending_updates: self.pending_updates(),
            is_healthy: is_healthy(
                state.active_subscriptions,
                state.last_sync,
                Instant::now(),
                self.threshold,
            ),
            active_subscriptions: state.active_subscriptions,
        }
    }

    /// Periodic health recomputation. Stops once the publisher is dropped.
    pub fn spawn_health_ticker(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(publisher) = weak.upgrade() else {
                    debug!("Status publisher dropped, stopping health ticker");
                    return;
                };
                publisher.recompute();
            }
        })
    }
}

fn stamp_sync(state: &mut PublisherState) {
    state.last_sync = Some(Instant::now());
    state.last_sync_at = Some(Utc::now());
}

/// One in-flight notification. Dropping it, whether the event was
/// dispatched, filtered out, or discarded at teardown, ends the count.
pub struct PendingGuard {
    publisher: Weak<StatusPublisher>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Some(publisher) = self.publisher.upgrade() {
            publisher.finish_update();
        }
    }
}
