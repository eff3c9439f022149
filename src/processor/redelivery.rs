//! Redelivery policy for failed deliveries.
//!
//! Decides whether a failed message goes back on the queue, and after what
//! delay, or is rejected for dead-lettering.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};

use crate::config::RedeliveryConfig;

/// How a delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Negative-acknowledge with requeue after waiting `delay`.
    Requeue { delay: Duration },
    /// Negative-acknowledge without requeue.
    DeadLetter,
}

/// Retry strategy applied to failed deliveries.
#[derive(Debug, Clone)]
pub struct RedeliveryPolicy {
    /// Attempts before dead-lettering. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Delay before the first requeue (before jitter).
    pub base_delay: Duration,
    /// Maximum delay cap (before jitter).
    pub max_delay: Duration,
    /// Add a random extra delay within `(0, delay)`.
    pub jitter: bool,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self::forever()
    }
}

impl RedeliveryPolicy {
    /// Requeue immediately, without limit.
    pub fn forever() -> Self {
        Self {
            max_attempts: None,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    pub fn from_config(config: &RedeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }

    /// Disposition for a delivery that failed on its `attempt`-th try.
    ///
    /// An unknown attempt number never dead-letters.
    pub fn on_failure(&self, attempt: Option<u32>) -> Disposition {
        match (attempt, self.max_attempts) {
            (Some(attempt), Some(max)) if attempt >= max => Disposition::DeadLetter,
            (attempt, _) => Disposition::Requeue {
                delay: self.delay_for_attempt(attempt.unwrap_or(1).saturating_sub(1)),
            },
        }
    }

    /// Delay before requeueing retry number `retry` (0-indexed).
    ///
    /// Exponential: base * 2^retry, capped at `max_delay`, then jittered.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let mut builder = ExponentialBuilder::default()
            .with_min_delay(self.base_delay.min(self.max_delay))
            .with_max_delay(self.max_delay)
            .with_factor(2.0)
            .without_max_times();
        if self.jitter {
            builder = builder.with_jitter();
        }

        // Past 64 doublings every delay is at the cap.
        builder
            .build()
            .nth(retry.min(64) as usize)
            .unwrap_or(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(max_attempts: Option<u32>) -> RedeliveryPolicy {
        RedeliveryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: false,
        }
    }

    #[test]
    fn test_default_requeues_immediately_forever() {
        let policy = RedeliveryPolicy::default();

        for attempt in [None, Some(1), Some(1_000_000)] {
            assert_eq!(
                policy.on_failure(attempt),
                Disposition::Requeue {
                    delay: Duration::ZERO
                }
            );
        }
    }

    #[test]
    fn test_delay_is_exponential_and_capped() {
        let policy = backoff(None);

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(63), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RedeliveryPolicy {
            jitter: true,
            ..backoff(None)
        };

        for _ in 0..100 {
            let first = policy.delay_for_attempt(0);
            assert!(
                first >= Duration::from_millis(100) && first < Duration::from_millis(200),
                "delay {:?} out of range",
                first
            );
            let capped = policy.delay_for_attempt(10);
            assert!(
                capped >= Duration::from_secs(1) && capped < Duration::from_secs(2),
                "delay {:?} out of range",
                capped
            );
        }
    }

    #[test]
    fn test_bounded_policy_dead_letters_on_last_attempt() {
        let policy = backoff(Some(3));

        assert_eq!(
            policy.on_failure(Some(1)),
            Disposition::Requeue {
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(
            policy.on_failure(Some(2)),
            Disposition::Requeue {
                delay: Duration::from_millis(200)
            }
        );
        assert_eq!(policy.on_failure(Some(3)), Disposition::DeadLetter);
        assert_eq!(policy.on_failure(Some(9)), Disposition::DeadLetter);
    }

    #[test]
    fn test_unknown_attempt_never_dead_letters() {
        let policy = backoff(Some(1));

        assert_eq!(
            policy.on_failure(None),
            Disposition::Requeue {
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(policy.on_failure(Some(1)), Disposition::DeadLetter);
    }

    #[test]
    fn test_from_config() {
        let policy = RedeliveryPolicy::from_config(&RedeliveryConfig {
            max_attempts: Some(5),
            base_delay_ms: 10,
            max_delay_ms: 50,
            jitter: true,
        });

        assert_eq!(policy.max_attempts, Some(5));
        assert_eq!(policy.base_delay, Duration::from_millis(10));
        assert_eq!(policy.max_delay, Duration::from_millis(50));
        assert!(policy.jitter);
    }
}
