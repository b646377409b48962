//! Retry policy for transactional and read work
//!
//! A [`RetryPolicy`] bounds how many times the manager runs a unit of work
//! and how long it sleeps between attempts. Only errors for which
//! [`PgmuxError::is_retryable`](pgmux_core::PgmuxError::is_retryable) holds
//! are retried.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use pgmux_connection::retry::{BackoffStrategy, RetryPolicy};
//!
//! let policy = RetryPolicy::default();
//! assert_eq!(policy.max_attempts(), 5);
//! assert_eq!(policy.delay_after(1), Duration::from_millis(25));
//!
//! let policy = RetryPolicy::new(3, BackoffStrategy::new(100, 1_000));
//! assert_eq!(policy.delay_after(2), Duration::from_millis(200));
//! ```

mod backoff;
mod policy;

#[cfg(test)]
mod tests;

pub use backoff::BackoffStrategy;
pub use policy::RetryPolicy;
