//! Retry policy: backoff delays for callback delivery.

use std::time::Duration;

/// Exponential backoff with a bounded number of attempts.
///
/// `delay(n) = base_delay * multiplier^(n - 1)`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub base_delay: Duration,

    pub multiplier: f64,

    pub max_delay: Duration,

    /// Total attempts including the first one. Zero behaves like one.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Delay to wait after the `attempts`-th failed attempt (1-indexed).
    ///
    /// With base 500ms and multiplier 2.0: 500ms, 1s, 2s, 4s, ...
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}
