use std::time::Duration;

use crate::config::RealtimeConfig;

/// Reconnect schedule for one channel.
///
/// The first reconnect after an unexpected failure waits `initial_delay`.
/// Each failed reconnect after that backs off exponentially from `base`,
/// capped at `max`. After `max_attempts` reconnects the channel gives up.
/// An open left unanswered for `subscribe_timeout` counts as a timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub subscribe_timeout: Duration,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            subscribe_timeout: Duration::from_secs(10),
            base_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            max_attempts: 5,
        }
    }
}

impl From<&RealtimeConfig> for ReconnectPolicy {
    fn from(cfg: &RealtimeConfig) -> Self {
        Self {
            initial_delay: Duration::from_secs(cfg.reconnect_delay_secs),
            subscribe_timeout: Duration::from_secs(cfg.subscribe_timeout_secs.max(1)),
            base_backoff_ms: cfg.backoff_base_ms,
            max_backoff_ms: cfg.backoff_max_ms,
            max_attempts: cfg.max_reconnect_attempts,
        }
    }
}

impl ReconnectPolicy {
    /// Exponential delay for the n-th failed reconnect (0-indexed).
    pub fn backoff(&self, failed_reconnects: u32) -> Duration {
        let exp = failed_reconnects.min(30);
        let delay = self.base_backoff_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    /// Delay before the next reconnect, given how many have already been
    /// made. `None` once the budget is spent.
    pub fn next_delay(&self, attempts_made: u32) -> Option<Duration> {
        if attempts_made >= self.max_attempts {
            return None;
        }
        if attempts_made == 0 {
            Some(self.initial_delay)
        } else {
            Some(self.backoff(attempts_made - 1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_waits_then_doubles() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<_> = (0..6).map(|n| policy.next_delay(n)).collect();

        assert_eq!(
            delays,
            vec![
                Some(Duration::from_secs(5)),
                Some(Duration::from_secs(1)),
                Some(Duration::from_secs(2)),
                Some(Duration::from_secs(4)),
                Some(Duration::from_secs(8)),
                None,
            ]
        );
    }

    #[test]
    fn backoff_is_capped() {
        let policy = ReconnectPolicy { max_attempts: 20, ..ReconnectPolicy::default() };
        assert_eq!(policy.backoff(5), Duration::from_secs(30));
        assert_eq!(policy.backoff(40), Duration::from_secs(30));
        assert_eq!(policy.next_delay(12), Some(Duration::from_secs(30)));
    }

    #[test]
    fn built_from_config() {
        let cfg = RealtimeConfig { reconnect_delay_secs: 2, max_reconnect_attempts: 3, ..RealtimeConfig::default() };
        let policy = ReconnectPolicy::from(&cfg);
        assert_eq!(policy.next_delay(0), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_delay(3), None);
    }
}
