//! Backoff delay calculator

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay schedule between retry attempts.
///
/// Delays grow by `multiplier` with each attempt, up to a configurable
/// maximum. A multiplier of 1 gives a fixed delay.
///
/// # Example
///
/// ```
/// use pgmux_connection::retry::BackoffStrategy;
/// use std::time::Duration;
///
/// let backoff = BackoffStrategy::new(100, 30_000);
/// assert_eq!(backoff.calculate_delay(0), Duration::from_millis(100));
/// assert_eq!(backoff.calculate_delay(1), Duration::from_millis(200));
///
/// let fixed = BackoffStrategy::fixed(Duration::from_millis(25));
/// assert_eq!(fixed.calculate_delay(7), Duration::from_millis(25));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffStrategy {
    /// Delay in milliseconds before the first retry
    initial_ms: u64,
    /// Cap for exponential growth
    max_ms: u64,
    /// Growth factor per attempt, never below 1.0
    multiplier: f64,
}

impl BackoffStrategy {
    /// Create an exponential strategy with the given initial and maximum delays
    /// and a multiplier of 2.0.
    pub fn new(initial_ms: u64, max_ms: u64) -> Self {
        Self {
            initial_ms,
            max_ms: max_ms.max(initial_ms),
            multiplier: 2.0,
        }
    }

    /// Same delay before every retry
    pub fn fixed(delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            initial_ms: ms,
            max_ms: ms,
            multiplier: 1.0,
        }
    }

    /// Set the multiplier for exponential growth.
    ///
    /// Values below 1.0 are clamped to 1.0.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Calculate the delay for a zero-based retry number.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_ms = (self.initial_ms as f64) * self.multiplier.powi(exponent);
        Duration::from_millis(delay_ms.min(self.max_ms as f64) as u64)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Whether every delay is the same
    pub fn is_fixed(&self) -> bool {
        self.multiplier <= 1.0 || self.initial_ms == self.max_ms
    }
}

impl Default for BackoffStrategy {
    /// Default backoff: 100ms initial, 30 seconds max, 2x multiplier
    fn default() -> Self {
        Self::new(100, 30_000)
    }
}
