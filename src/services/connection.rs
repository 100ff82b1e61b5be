use std::time::Duration;

use tokio::task::JoinHandle;

use crate::services::backoff::ReconnectPolicy;
use crate::services::transport::{ChannelId, TransportEvent};
use crate::state::status::ConnectionStatus;

/// What to do after a channel failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPlan {
    Schedule(Duration),
    /// A timer is already pending for this key.
    AlreadyPending,
    /// The budget ran out just now; report it once.
    Exhausted,
    /// Already gave up earlier; wait for a manual retry.
    Idle,
}

/// Connection state of the one channel a subscription owns.
#[derive(Debug)]
pub struct ChannelState {
    pub id: ChannelId,
    pub name: String,
    pub status: ConnectionStatus,
    /// Reconnects made since the last `Subscribed` or manual retry.
    pub attempts: u32,
    pub exhausted: bool,
    /// An open was requested and the feed has not answered yet.
    pub in_flight: bool,
    reconnect_timer: Option<JoinHandle<()>>,
    /// Turns an unanswered open into a timeout.
    open_timer: Option<JoinHandle<()>>,
}

impl ChannelState {
    pub fn new(id: ChannelId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            status: ConnectionStatus::Disconnected,
            attempts: 0,
            exhausted: false,
            in_flight: true,
            reconnect_timer: None,
            open_timer: None,
        }
    }

    /// Applies a lifecycle signal. Data events leave the status alone.
    pub fn apply(&mut self, event: &TransportEvent) -> ConnectionStatus {
        if event.target_status().is_some() {
            self.in_flight = false;
            self.cancel_open_timer();
        }
        match event.target_status() {
            Some(ConnectionStatus::Connected) => {
                self.status = ConnectionStatus::Connected;
                self.attempts = 0;
                self.exhausted = false;
                self.cancel_timer();
            }
            Some(status) => self.status = status,
            None => {}
        }
        self.status
    }

    pub fn plan_reconnect(&mut self, policy: &ReconnectPolicy) -> ReconnectPlan {
        if self.has_pending_timer() {
            return ReconnectPlan::AlreadyPending;
        }
        if self.exhausted {
            return ReconnectPlan::Idle;
        }
        match policy.next_delay(self.attempts) {
            Some(delay) => ReconnectPlan::Schedule(delay),
            None => {
                self.exhausted = true;
                ReconnectPlan::Exhausted
            }
        }
    }

    pub fn has_pending_timer(&self) -> bool {
        self.reconnect_timer.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn arm_timer(&mut self, timer: JoinHandle<()>) {
        self.cancel_timer();
        self.reconnect_timer = Some(timer);
    }

    /// Forget the timer that is firing right now, without aborting it.
    pub fn disarm_timer(&mut self) {
        self.reconnect_timer = None;
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    pub fn arm_open_timer(&mut self, timer: JoinHandle<()>) {
        self.cancel_open_timer();
        self.open_timer = Some(timer);
    }

    /// Forget the open timeout that is firing right now.
    pub fn disarm_open_timer(&mut self) {
        self.open_timer = None;
    }

    pub fn cancel_open_timer(&mut self) {
        if let Some(timer) = self.open_timer.take() {
            timer.abort();
        }
    }

    /// Moves to a freshly allocated channel for a reconnect attempt.
    pub fn begin_reconnect(&mut self, next_id: ChannelId) -> ChannelId {
        let old = self.id;
        self.id = next_id;
        self.attempts = self.attempts.saturating_add(1);
        self.status = ConnectionStatus::Reconnecting;
        self.in_flight = true;
        self.cancel_open_timer();
        old
    }

    /// Manual retry: a fresh budget.
    pub fn reset_budget(&mut self) {
        self.cancel_timer();
        self.attempts = 0;
        self.exhausted = false;
    }
}

impl Drop for ChannelState {
    fn drop(&mut self) {
        self.cancel_timer();
        self.cancel_open_timer();
    }
}
