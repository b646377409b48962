//! Tests for the retry module

use super::*;
use pgmux_core::PgmuxError;
use std::time::Duration;

mod backoff_tests {
    use super::*;

    #[test]
    fn test_backoff_exponential_growth() {
        let backoff = BackoffStrategy::new(100, 30_000);

        assert_eq!(backoff.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(backoff.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(backoff.calculate_delay(2), Duration::from_millis(400));
        assert_eq!(backoff.calculate_delay(3), Duration::from_millis(800));
        assert_eq!(backoff.calculate_delay(4), Duration::from_millis(1600));
    }

    #[test]
    fn test_backoff_capped_at_max() {
        let backoff = BackoffStrategy::new(100, 1_000);
        assert_eq!(backoff.calculate_delay(10), Duration::from_millis(1_000));
        assert_eq!(backoff.calculate_delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_max_never_below_initial() {
        let backoff = BackoffStrategy::new(500, 100);
        assert_eq!(backoff.max_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_custom_multiplier() {
        let backoff = BackoffStrategy::new(100, 30_000).with_multiplier(3.0);
        assert_eq!(backoff.calculate_delay(2), Duration::from_millis(900));

        let clamped = BackoffStrategy::new(100, 30_000).with_multiplier(0.5);
        assert_eq!(clamped.multiplier(), 1.0);
    }

    #[test]
    fn test_backoff_fixed() {
        let backoff = BackoffStrategy::fixed(Duration::from_millis(25));
        assert!(backoff.is_fixed());
        for attempt in 0..10 {
            assert_eq!(backoff.calculate_delay(attempt), Duration::from_millis(25));
        }
    }
}

mod policy_tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 5);
        assert!(policy.backoff().is_fixed());
        assert_eq!(policy.delay_after(1), Duration::from_millis(25));
        assert_eq!(policy.delay_after(4), Duration::from_millis(25));
    }

    #[test]
    fn test_should_retry_bounds_attempts() {
        let policy = RetryPolicy::default();
        let err = PgmuxError::database("40001", "could not serialize access");

        for attempt in 1..5 {
            assert!(policy.should_retry(attempt, &err));
        }
        assert!(!policy.should_retry(5, &err));
    }

    #[test]
    fn test_should_retry_only_retryable_errors() {
        let policy = RetryPolicy::default();
        assert!(!policy.should_retry(1, &PgmuxError::database("23505", "duplicate key")));
        assert!(!policy.should_retry(1, &PgmuxError::ConnectionEnded));
        assert!(policy.should_retry(1, &PgmuxError::ConnectionClosed));
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts(), 1);
        assert!(!policy.should_retry(1, &PgmuxError::ConnectionClosed));
    }

    #[test]
    fn test_max_attempts_clamped() {
        assert_eq!(RetryPolicy::default().with_max_attempts(0).max_attempts(), 1);
    }

    #[test]
    fn test_policy_serialization() {
        let policy = RetryPolicy::new(3, BackoffStrategy::new(10, 100));
        let json = serde_json::to_string(&policy).expect("serialize");
        let back: RetryPolicy = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, policy);
    }
}
