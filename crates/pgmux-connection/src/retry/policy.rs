//! Attempt bounds for the manager's retry loops

use std::time::Duration;

use pgmux_core::PgmuxError;
use serde::{Deserialize, Serialize};

use super::BackoffStrategy;

/// Number of attempts the manager makes before giving up
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Pause between attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(25);

/// How often and how patiently a unit of work is retried
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    max_attempts: u32,
    backoff: BackoffStrategy,
}

impl RetryPolicy {
    /// Create a policy. `max_attempts` is clamped to at least one attempt.
    pub fn new(max_attempts: u32, backoff: BackoffStrategy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Run each unit of work once
    pub fn no_retry() -> Self {
        Self::new(1, BackoffStrategy::fixed(Duration::ZERO))
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> &BackoffStrategy {
        &self.backoff
    }

    /// Whether another attempt should follow failed attempt number `attempt`
    /// (1-based).
    pub fn should_retry(&self, attempt: u32, error: &PgmuxError) -> bool {
        attempt < self.max_attempts && error.is_retryable()
    }

    /// Sleep before the attempt following failed attempt number `attempt`
    /// (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff.calculate_delay(attempt.saturating_sub(1))
    }
}

impl Default for RetryPolicy {
    /// 5 attempts with a fixed 25ms pause
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_ATTEMPTS,
            BackoffStrategy::fixed(DEFAULT_RETRY_DELAY),
        )
    }
}
