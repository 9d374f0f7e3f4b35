//! Retry budget and backoff.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How many times an entry may fail retryably, and how long to wait between
/// attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed per retry budget before the entry is dead-lettered.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0); the delay is spread by ± this fraction.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(5 * 60),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with exponential backoff and the default jitter.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            ..Default::default()
        }
    }

    /// Same policy without randomness. Handy for deterministic tests.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Whether another attempt is allowed after `attempts` failures in the
    /// current budget.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Capped exponential delay before jitter, for a 1-indexed attempt.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);

        Duration::from_millis((base_ms * exp).min(max_ms) as u64)
    }

    /// Delay for a 1-indexed attempt with random jitter applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let unit = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        self.delay_with_unit(attempt, unit)
    }

    /// Apply jitter using `unit` in `[-1.0, 1.0]` as the random factor.
    pub fn delay_with_unit(&self, attempt: u32, unit: f64) -> Duration {
        let delay_ms = self.base_delay_for_attempt(attempt).as_millis() as f64;
        let jitter = self.jitter.clamp(0.0, 1.0);
        let spread = delay_ms * jitter * unit.clamp(-1.0, 1.0);

        Duration::from_millis((delay_ms + spread).max(0.0) as u64)
    }
}
