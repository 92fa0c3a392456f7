//! Retry delay policy for transient request failures.
//!
//! Attempt numbering starts at zero for the first *retry* (the original
//! request is not counted). Exponential delays are
//! `min(max_delay, base_delay * 2^attempt * (1 + jitter))`; rate-limited
//! responses use the linear `rate_limit_floor + attempt * rate_limit_step`
//! instead.

use std::time::Duration;

use rand::Rng;

use crate::error::ErrorKind;

/// Tunable parameters for request retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry, before jitter.
    pub base_delay: Duration,
    /// Upper bound on any exponential delay.
    pub max_delay: Duration,
    /// Jitter is drawn from `[0, max_jitter)` and applied as `1 + jitter`.
    pub max_jitter: f64,
    /// Minimum wait after a 429.
    pub rate_limit_floor: Duration,
    /// Extra wait per retry after a 429.
    pub rate_limit_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_jitter: 0.1,
            rate_limit_floor: Duration::from_millis(5000),
            rate_limit_step: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Whether another retry is allowed after `attempt` retries have run.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Delay before retry number `attempt`, drawing fresh jitter.
    pub fn next_delay(&self, attempt: u32, kind: ErrorKind) -> Duration {
        let jitter = if self.max_jitter > 0.0 {
            rand::rng().random_range(0.0..self.max_jitter)
        } else {
            0.0
        };
        self.delay_for(attempt, kind, jitter)
    }

    /// Deterministic delay computation with an explicit jitter sample.
    pub fn delay_for(&self, attempt: u32, kind: ErrorKind, jitter: f64) -> Duration {
        if kind == ErrorKind::RateLimited {
            return self.rate_limit_floor + self.rate_limit_step * attempt;
        }
        let factor = 2f64.powi(attempt.min(30) as i32) * (1.0 + jitter);
        let ms = (self.base_delay.as_millis() as f64 * factor) as u64;
        Duration::from_millis(ms).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_without_jitter_doubles() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (0..4)
            .map(|n| policy.delay_for(n, ErrorKind::ServerError, 0.0).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000]);
    }

    #[test]
    fn jitter_stretches_by_at_most_ten_percent() {
        let policy = RetryPolicy::default();
        let d = policy.delay_for(1, ErrorKind::Network, 0.099);
        assert!(d >= Duration::from_millis(2000));
        assert!(d < Duration::from_millis(2200));
    }

    #[test]
    fn exponential_clamps_at_max() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_for(10, ErrorKind::ServerError, 0.05),
            Duration::from_millis(30_000)
        );
        // Large attempt numbers must not overflow.
        assert_eq!(
            policy.delay_for(u32::MAX, ErrorKind::Timeout, 0.0),
            Duration::from_millis(30_000)
        );
    }

    #[test]
    fn rate_limited_uses_linear_floor() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (0..3)
            .map(|n| policy.delay_for(n, ErrorKind::RateLimited, 0.09).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![5000, 7000, 9000]);
    }

    #[test]
    fn sampled_sequence_is_non_decreasing() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let mut prev = Duration::ZERO;
            for attempt in 0..policy.max_retries {
                let d = policy.next_delay(attempt, ErrorKind::ServerError);
                assert!(d >= prev, "{d:?} < {prev:?}");
                assert!(d <= policy.max_delay);
                prev = d;
            }
        }
    }

    #[test]
    fn allows_three_retries_by_default() {
        let policy = RetryPolicy::default();
        assert!(policy.allows(0));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
        assert!(!RetryPolicy::none().allows(0));
    }
}
