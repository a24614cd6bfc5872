//! Exponential backoff retry policy with jitter.
//!
//! Decides whether a failed delivery gets another attempt and when the
//! next attempt becomes eligible. The policy is a trait object held by the
//! queue behind a lock, so it can be swapped at runtime without
//! reconstructing the queue.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use relay_core::{Delivery, DeliveryStatus};

/// Default base delay for the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Default ceiling on any single retry delay (5 minutes).
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(300_000);

/// Retry policy consulted after every failed attempt.
///
/// The policy treats all attempt failures identically: a permanently wrong
/// payload and a transient outage consume retry budget the same way. This
/// uniformity is deliberate and flagged for product review rather than
/// silently refined here.
pub trait RetrySchedule: Send + Sync + std::fmt::Debug {
    /// Whether the delivery has retry budget left.
    ///
    /// True iff the delivery is not completed and `attempts <
    /// max_attempts`.
    fn should_retry(&self, delivery: &Delivery) -> bool;

    /// Delay before the attempt numbered `attempts` becomes eligible.
    fn backoff_delay(&self, attempts: u32) -> Duration;

    /// Absolute time of the next eligible attempt.
    fn next_retry_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.backoff_delay(attempts);
        now + chrono::Duration::milliseconds(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX))
    }
}

/// Exponential backoff: `min(base * 2^attempts, cap)`, multiplied by a
/// random jitter factor in `[1.0, 1.5)`.
///
/// The jitter spreads retries for the same endpoint across time so a
/// recovering endpoint is not hit by a synchronized retry storm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoff {
    /// Base delay before doubling.
    pub base: Duration,
    /// Ceiling on the un-jittered delay.
    pub cap: Duration,
}

impl ExponentialBackoff {
    /// Creates a policy with the given base and cap.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self { base: DEFAULT_BASE_DELAY, cap: DEFAULT_MAX_DELAY }
    }
}

impl RetrySchedule for ExponentialBackoff {
    fn should_retry(&self, delivery: &Delivery) -> bool {
        delivery.status != DeliveryStatus::Completed && delivery.attempts < delivery.max_attempts
    }

    fn backoff_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.min(30);
        let multiplier = 2_u64.saturating_pow(exponent);
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let cap_ms = u64::try_from(self.cap.as_millis()).unwrap_or(u64::MAX);
        let capped_ms = base_ms.saturating_mul(multiplier).min(cap_ms);

        let jitter = rand::rng().random_range(1.0..1.5);
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let jittered_ms = (capped_ms as f64 * jitter) as u64;

        Duration::from_millis(jittered_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;
    use relay_core::{BlockchainEvent, SubscriptionId, WebhookId};

    use super::*;

    fn delivery_with_attempts(attempts: i32, max_attempts: i32) -> Delivery {
        let event = BlockchainEvent {
            contract_address: "0xabc".to_string(),
            event_name: "Transfer".to_string(),
            block_number: 1,
            transaction_hash: "0xdead".to_string(),
            log_index: 0,
            args: BTreeMap::new(),
            timestamp: Utc::now(),
        };
        let mut delivery = Delivery::new(
            SubscriptionId::new(),
            WebhookId::new(),
            event,
            serde_json::json!({}),
            max_attempts,
            Utc::now(),
        );
        delivery.attempts = attempts;
        delivery
    }

    #[test]
    fn retries_allowed_below_budget() {
        let policy = ExponentialBackoff::default();
        for attempts in 0..3 {
            assert!(policy.should_retry(&delivery_with_attempts(attempts, 3)));
        }
    }

    #[test]
    fn retries_denied_at_budget_regardless_of_status() {
        let policy = ExponentialBackoff::default();
        let mut delivery = delivery_with_attempts(3, 3);
        assert!(!policy.should_retry(&delivery));

        delivery.status = DeliveryStatus::Processing;
        assert!(!policy.should_retry(&delivery));
    }

    #[test]
    fn completed_deliveries_never_retry() {
        let policy = ExponentialBackoff::default();
        let mut delivery = delivery_with_attempts(0, 3);
        delivery.status = DeliveryStatus::Completed;
        assert!(!policy.should_retry(&delivery));
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let policy =
            ExponentialBackoff::new(Duration::from_millis(1000), Duration::from_millis(8000));

        // Jitter is in [1.0, 1.5), so each delay is bounded below by the
        // un-jittered value and above by 1.5x.
        for (n, expected_ms) in [(0u32, 1000u64), (1, 2000), (2, 4000), (3, 8000)] {
            let delay = policy.backoff_delay(n);
            assert!(
                delay >= Duration::from_millis(expected_ms),
                "attempt {n}: {delay:?} below floor {expected_ms}ms"
            );
            assert!(
                delay < Duration::from_millis(expected_ms * 3 / 2),
                "attempt {n}: {delay:?} above jitter ceiling"
            );
        }
    }

    #[test]
    fn backoff_capped_for_large_attempt_counts() {
        let policy =
            ExponentialBackoff::new(Duration::from_millis(1000), Duration::from_millis(8000));

        let delay = policy.backoff_delay(10);
        assert!(delay <= Duration::from_millis(8000 * 3 / 2));
    }

    #[test]
    fn next_retry_is_in_the_future() {
        let policy = ExponentialBackoff::default();
        let now = Utc::now();

        let next = policy.next_retry_at(1, now);
        assert!(next > now);
    }

    proptest! {
        #[test]
        fn backoff_always_within_jitter_bounds(attempts in 0u32..40) {
            let base = Duration::from_millis(500);
            let cap = Duration::from_millis(60_000);
            let policy = ExponentialBackoff::new(base, cap);

            let floor_ms = 500u64
                .saturating_mul(2u64.saturating_pow(attempts.min(30)))
                .min(60_000);

            let delay = policy.backoff_delay(attempts);
            prop_assert!(delay >= Duration::from_millis(floor_ms));
            prop_assert!(delay < Duration::from_millis(floor_ms * 3 / 2));
        }

        #[test]
        fn budget_boundary_is_exact(attempts in 0i32..10, max in 1i32..10) {
            let policy = ExponentialBackoff::default();
            let delivery = delivery_with_attempts(attempts, max);
            prop_assert_eq!(policy.should_retry(&delivery), attempts < max);
        }
    }
}
