//! Exponential backoff for retried messages.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Delay applied before a retried message becomes available again.
///
/// A first attempt (retry count 0) is available immediately. Retry `r`
/// waits `initial_delay * multiplier^r`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Base delay.
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
}

impl Backoff {
    /// Backoff of `2^r` seconds capped at ten minutes.
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(600),
            multiplier: 2.0,
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Calculate the delay for a message that was already tried `retry_count` times.
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_delay as u64)
    }

    /// Instant at which a message pushed at `now` becomes available.
    pub fn available_at(&self, now: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        let delay = self.delay_for_retry(retry_count);
        now + chrono::Duration::milliseconds(delay.as_millis() as i64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
