//! Retry policy for transport calls

use mailcast_common::config::DispatchConfig;
use std::time::Duration;

/// Attempts and exponential backoff for one recipient
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: Duration::from_millis(config.retry_base_ms),
            max: Duration::from_millis(config.retry_max_ms),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, self.base, self.max)
    }
}

/// Calculate exponential backoff delay: `base * 2^(attempt-1)`, capped at `max`
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(2_u32.pow(exponent))
        .map_or(max, |delay| delay.min(max))
}
