//! The realtime context: one per application root.
//!
//! It owns the subscription registry, drives each channel's connection state
//! machine, and feeds change events to the router. Every transport signal
//! goes through [`RealtimeContext::handle_transport_event`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::RealtimeConfig;
use crate::errors::SyncError;
use crate::services::backoff::ReconnectPolicy;
use crate::services::connection::{ChannelState, ReconnectPlan};
use crate::services::publisher::StatusPublisher;
use crate::services::registry::{Entry, SubscriptionRegistry};
use crate::services::router::{spawn_dispatcher, Delivery, EventRouter, OwnershipLookup, Route};
use crate::services::transport::{ChannelId, Transport, TransportEvent};
use crate::state::status::{ConnectionStatus, StatusSnapshot};
use crate::state::subscription::{ErrorCallback, StatusCallback, SubscriptionConfig};

/// Handle the transport uses to report back. Outlives nothing: once the
/// context is gone, emitted events are dropped.
#[derive(Clone)]
pub struct EventSink {
    ctx: Weak<RealtimeContext>,
}

impl EventSink {
    pub fn emit(&self, channel: ChannelId, event: TransportEvent) {
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.handle_transport_event(channel, event);
        }
    }
}

pub struct RealtimeContext {
    registry: Mutex<SubscriptionRegistry>,
    transport: Arc<dyn Transport>,
    router: Arc<EventRouter>,
    publisher: Arc<StatusPublisher>,
    policy: ReconnectPolicy,
    health_ticker: Mutex<Option<JoinHandle<()>>>,
    this: Weak<RealtimeContext>,
}

struct SignalOutcome {
    status: ConnectionStatus,
    errors: Vec<SyncError>,
    on_error: Option<ErrorCallback>,
    on_status: Option<StatusCallback>,
}

impl RealtimeContext {
    /// Builds the context and starts its health ticker. Must be called from
    /// within a tokio runtime.
    pub fn create(
        cfg: &RealtimeConfig,
        transport: Arc<dyn Transport>,
        lookup: Arc<dyn OwnershipLookup>,
    ) -> Arc<Self> {
        let publisher = Arc::new(StatusPublisher::new(cfg.health_threshold()));
        let router = Arc::new(EventRouter::new(lookup, publisher.clone()));
        let ticker = publisher.spawn_health_ticker(cfg.health_tick());

        Arc::new_cyclic(|this| Self {
            registry: Mutex::new(SubscriptionRegistry::default()),
            transport,
            router,
            publisher,
            policy: ReconnectPolicy::from(cfg),
            health_ticker: Mutex::new(Some(ticker)),
            this: this.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SubscriptionRegistry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sink(&self) -> EventSink {
        EventSink { ctx: self.this.clone() }
    }

    pub fn publisher(&self) -> &Arc<StatusPublisher> {
        &self.publisher
    }

    pub fn status(&self) -> StatusSnapshot {
        self.publisher.snapshot()
    }

    pub fn watch_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.publisher.watch()
    }

    pub fn subscription_keys(&self) -> Vec<String> {
        self.lock().keys()
    }

    pub fn channel_status(&self, key: &str) -> Option<ConnectionStatus> {
        self.lock().get_mut(key).map(|entry| entry.channel.status)
    }

    /// Registers `config` under `key`, replacing any subscription already
    /// there. Only configuration problems are returned; transport failures
    /// arrive as status changes and through `on_error`.
    pub fn add_subscription(&self, key: &str, config: SubscriptionConfig) -> Result<(), SyncError> {
        if key.trim().is_empty() {
            return Err(SyncError::InvalidConfig("subscription key is required".into()));
        }
        config.validate()?;

        let (replaced, spec, count) = {
            let mut registry = self.lock();
            if registry.is_disposed() {
                return Err(SyncError::Disposed);
            }

            let channel_id = registry.allocate_channel_id();
            let (queue, dispatcher) = spawn_dispatcher(self.router.clone(), Route::new(key, &config));
            let mut entry = Entry {
                key: key.to_string(),
                channel: ChannelState::new(channel_id, format!("realtime:{key}")),
                config,
                created_at: Utc::now(),
                queue,
                dispatcher,
            };
            entry.channel.arm_open_timer(self.spawn_open_timeout(channel_id));
            let spec = entry.channel_spec();
            let replaced = registry.insert(entry);
            (replaced, spec, registry.len())
        };

        if let Some(old) = replaced {
            debug!("Replacing subscription {} (channel {})", key, old.channel.id);
            self.teardown(old);
        }
        self.publisher.set_active_subscriptions(count);

        info!(
            "Subscribed {} to {} {:?} on channel {}",
            key, spec.table, spec.events, spec.channel_id
        );
        if let Err(e) = self.transport.open(&spec, self.sink()) {
            warn!("Opening channel {} for {} failed: {}", spec.channel_id, key, e);
            self.handle_transport_event(
                spec.channel_id,
                TransportEvent::ChannelError { message: Some(e.to_string()) },
            );
        }
        Ok(())
    }

    /// Unsubscribes `key`. Returns whether anything was registered.
    pub fn remove_subscription(&self, key: &str) -> bool {
        let (removed, count) = {
            let mut registry = self.lock();
            (registry.remove(key), registry.len())
        };

        let Some(entry) = removed else {
            trace!("No subscription {} to remove", key);
            return false;
        };

        self.teardown(entry);
        self.publisher.set_active_subscriptions(count);
        info!("Unsubscribed {}", key);
        true
    }

    /// Root teardown: closes every channel and stops the health ticker.
    /// Later calls do nothing.
    pub fn dispose_all(&self) {
        let Some(entries) = self.lock().dispose() else {
            debug!("Realtime context already disposed");
            return;
        };

        let count = entries.len();
        for entry in entries {
            self.teardown(entry);
        }

        let ticker = self
            .health_ticker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(ticker) = ticker {
            ticker.abort();
        }

        self.publisher.set_active_subscriptions(0);
        info!("Realtime context disposed, closed {} channels", count);
    }

    fn teardown(&self, entry: Entry) {
        self.transport.close(entry.channel.id);
        // Dropping the entry aborts its reconnect timer and dispatcher.
        drop(entry);
    }

    /// Single entry point for everything the transport reports.
    /// Signals for unknown or replaced channels are ignored.
    pub fn handle_transport_event(&self, channel: ChannelId, event: TransportEvent) {
        match event {
            TransportEvent::DataChanged { payload } => {
                let mut registry = self.lock();
                let Some(entry) = registry.by_channel_mut(channel) else {
                    trace!("Ignoring change on inactive channel {}", channel);
                    return;
                };
                let pending = self.publisher.begin_update();
                if entry.queue.send(Delivery { event: payload, pending }).is_err() {
                    debug!("Dispatcher for {} is gone, dropping change", entry.key);
                }
            }
            signal => self.apply_signal(channel, signal),
        }
    }

    fn apply_signal(&self, channel: ChannelId, signal: TransportEvent) {
        self.apply_lifecycle(channel, signal, false);
    }

    /// With `only_in_flight`, the signal is applied only while the channel's
    /// open is still unanswered.
    fn apply_lifecycle(&self, channel: ChannelId, signal: TransportEvent, only_in_flight: bool) {
        let outcome = {
            let mut registry = self.lock();
            let Some(entry) = registry.by_channel_mut(channel) else {
                debug!("Ignoring {:?} on inactive channel {}", signal, channel);
                return;
            };
            if only_in_flight {
                if !entry.channel.in_flight {
                    return;
                }
                entry.channel.disarm_open_timer();
            }

            let status = entry.channel.apply(&signal);
            let mut errors: Vec<SyncError> = signal.failure(&entry.key).into_iter().collect();

            if status == ConnectionStatus::Disconnected {
                match entry.channel.plan_reconnect(&self.policy) {
                    ReconnectPlan::Schedule(delay) => {
                        info!("Reconnecting {} in {:?}", entry.key, delay);
                        let timer = self.spawn_reconnect_timer(entry.key.clone(), channel, delay);
                        entry.channel.arm_timer(timer);
                    }
                    ReconnectPlan::AlreadyPending => {
                        debug!("Reconnect for {} already scheduled", entry.key);
                    }
                    ReconnectPlan::Exhausted => {
                        warn!("Giving up on {} after {} reconnects", entry.key, entry.channel.attempts);
                        errors.push(SyncError::ReconnectExhausted {
                            key: entry.key.clone(),
                            attempts: entry.channel.attempts,
                        });
                    }
                    ReconnectPlan::Idle => {}
                }
            }

            // Published under the registry lock so the global status follows
            // channel transitions in the order they were applied.
            self.publisher.set_status(status);

            SignalOutcome {
                status,
                errors,
                on_error: entry.config.on_error.clone(),
                on_status: entry.config.on_status.clone(),
            }
        };

        notify_status(outcome.on_status.as_ref(), outcome.status);
        for error in &outcome.errors {
            warn!("{}", error);
            notify_error(outcome.on_error.as_ref(), error);
        }
    }

    fn spawn_reconnect_timer(&self, key: String, channel: ChannelId, delay: Duration) -> JoinHandle<()> {
        let ctx = self.this.clone();
        let deadline = Instant::now() + delay;
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(ctx) = ctx.upgrade() {
                ctx.fire_reconnect(&key, channel);
            }
        })
    }

    fn spawn_open_timeout(&self, channel: ChannelId) -> JoinHandle<()> {
        let ctx = self.this.clone();
        let deadline = Instant::now() + self.policy.subscribe_timeout;
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(ctx) = ctx.upgrade() {
                ctx.expire_open(channel);
            }
        })
    }

    fn expire_open(&self, channel: ChannelId) {
        debug!("Open on channel {} went unanswered", channel);
        self.apply_lifecycle(channel, TransportEvent::TimedOut, true);
    }

    /// Reopens `key` on a fresh channel, provided it still sits on `expected`.
    fn fire_reconnect(&self, key: &str, expected: ChannelId) {
        let (old, spec, attempt, on_status) = {
            let mut registry = self.lock();
            let next = registry.allocate_channel_id();
            let Some(entry) = registry.get_mut(key) else {
                return;
            };
            if entry.channel.id != expected {
                return;
            }

            entry.channel.disarm_timer();
            let old = entry.channel.begin_reconnect(next);
            entry.channel.arm_open_timer(self.spawn_open_timeout(next));
            let spec = entry.channel_spec();
            let attempt = entry.channel.attempts;
            let on_status = entry.config.on_status.clone();
            registry.rebind(key, old, next);
            self.publisher.set_status(ConnectionStatus::Reconnecting);
            (old, spec, attempt, on_status)
        };

        info!(
            "Reconnect attempt {}/{} for {} on channel {}",
            attempt, self.policy.max_attempts, key, spec.channel_id
        );
        notify_status(on_status.as_ref(), ConnectionStatus::Reconnecting);

        self.transport.close(old);
        if let Err(e) = self.transport.open(&spec, self.sink()) {
            self.handle_transport_event(
                spec.channel_id,
                TransportEvent::ChannelError { message: Some(e.to_string()) },
            );
        }
    }

    /// Manual retry for one key with a fresh reconnect budget. A channel
    /// with an open already in flight is left alone; its open timeout
    /// settles it. Returns whether a new attempt was started.
    pub fn retry_connection(&self, key: &str) -> bool {
        let expected = {
            let mut registry = self.lock();
            let Some(entry) = registry.get_mut(key) else {
                return false;
            };
            if entry.channel.in_flight || entry.channel.status == ConnectionStatus::Reconnecting {
                return false;
            }
            if entry.channel.status == ConnectionStatus::Connected {
                return false;
            }
            entry.channel.reset_budget();
            entry.channel.id
        };

        self.fire_reconnect(key, expected);
        true
    }

    /// Manual retry for every subscription that is not connected.
    /// Returns how many new attempts were started.
    pub fn reconnect(&self) -> usize {
        let keys = self.subscription_keys();
        keys.iter().filter(|key| self.retry_connection(key)).count()
    }
}

fn notify_status(handler: Option<&StatusCallback>, status: ConnectionStatus) {
    if let Some(handler) = handler {
        if catch_unwind(AssertUnwindSafe(|| handler(status))).is_err() {
            warn!("Connection status handler panicked");
        }
    }
}

fn notify_error(handler: Option<&ErrorCallback>, error: &SyncError) {
    if let Some(handler) = handler {
        if catch_unwind(AssertUnwindSafe(|| handler(error))).is_err() {
            warn!("Error handler panicked");
        }
    }
}
