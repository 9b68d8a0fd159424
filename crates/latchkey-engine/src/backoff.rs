//! Exponential reconnect backoff.

use std::time::Duration;

use latchkey_core::BackoffSettings;

/// Exponential backoff with a capped delay and no attempt limit.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
            attempt: 0,
        }
    }

    pub fn from_settings(settings: &BackoffSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.initial_ms),
            Duration::from_millis(settings.max_ms),
            settings.multiplier,
        )
    }

    /// Delay before the given attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        if millis.is_finite() && millis < self.max.as_millis() as f64 {
            Duration::from_millis(millis as u64)
        } else {
            self.max
        }
    }

    /// Record a failed attempt and return the delay before the next one.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.delay_for_attempt(self.attempt)
    }

    /// Number of failures since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Start over after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_settings(&BackoffSettings::default())
    }
}
