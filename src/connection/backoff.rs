//! Reconnection backoff policy

use std::time::Duration;

/// Default delay before the first reconnection attempt
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(3000);

/// Default number of reconnection attempts before giving up
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Growth factor between consecutive attempts
pub const BACKOFF_MULTIPLIER: f64 = 1.5;

/// Upper bound on any single reconnection delay
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Capped exponential backoff: `base * 1.5^(attempt - 1)` for attempts
/// `1..=max_attempts`. Past the cap the connection is considered failed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnection `attempt` (1-based), at most
    /// [`MAX_RECONNECT_DELAY`], or `None` when the attempt is beyond the cap.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        if self.base_delay.is_zero() {
            return Some(Duration::ZERO);
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let factor = BACKOFF_MULTIPLIER.powi(exponent);
        let delay = Duration::try_from_secs_f64(self.base_delay.as_secs_f64() * factor)
            .unwrap_or(MAX_RECONNECT_DELAY);
        Some(delay.min(MAX_RECONNECT_DELAY))
    }
}
