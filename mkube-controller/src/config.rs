//! Controller tuning.

use std::time::Duration;

/// Retry, timeout and watch settings for the controller loop.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Attempts per Create/Update before the identity is marked Degraded.
    pub max_attempts: u32,
    /// Backoff after the first failed attempt; doubles per attempt.
    pub initial_backoff: Duration,
    /// Upper bound for a single backoff.
    pub max_backoff: Duration,
    /// Bound on every executor call; elapsed calls count as transient failures.
    pub action_timeout: Duration,
    /// Re-enqueue every known identity at this interval.
    pub resync_interval: Option<Duration>,
    /// Wait before re-opening a watch feed that ended.
    pub watch_restart_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            action_timeout: Duration::from_secs(30),
            resync_interval: Some(Duration::from_secs(60)),
            watch_restart_delay: Duration::from_secs(1),
        }
    }
}

impl ControllerConfig {
    /// Backoff to wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}
