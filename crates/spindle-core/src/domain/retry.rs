//! Retry policy: decides backoff delays.

use std::time::Duration;

use rand::Rng;

/// 15 seconds.
pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_millis(15_000);

/// 7 days.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(604_800_000);

/// Exponential backoff between retries of a failed message.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry, and the lower clamp.
    pub min_backoff: Duration,

    /// Upper clamp.
    pub max_backoff: Duration,

    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_BACKOFF, DEFAULT_MAX_BACKOFF)
    }
}

impl RetryPolicy {
    pub fn new(min_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            min_backoff,
            max_backoff,
            multiplier: 2.0,
        }
    }

    /// Delay for the retry following attempt number `attempts` (1-indexed).
    ///
    /// `min_backoff * multiplier^(attempts - 1)`, clamped to
    /// `[min_backoff, max_backoff]`:
    /// - attempt 1: min_backoff
    /// - attempt 2: 2 * min_backoff
    /// - attempt 3: 4 * min_backoff
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(32) as i32;
        let base_ms = self.min_backoff.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(exponent);
        let upper = self.max_backoff.max(self.min_backoff);
        let delay = Duration::from_millis(delay_ms.min(upper.as_millis() as f64) as u64);
        delay.clamp(self.min_backoff, upper)
    }

    /// `next_delay` with jitter: a uniform pick in `[delay / 2, delay]`.
    pub fn next_delay_with_jitter(&self, attempts: u32) -> Duration {
        let delay = self.next_delay(attempts);
        let half = delay / 2;
        let spread = (delay - half).as_millis() as u64;
        if spread == 0 {
            return delay;
        }
        half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_policy_has_reasonable_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.min_backoff, Duration::from_secs(15));
        assert_eq!(policy.max_backoff, Duration::from_secs(7 * 24 * 60 * 60));
        assert_eq!(policy.multiplier, 2.0);
    }

    #[rstest]
    #[case::first_attempt(1, 100)]
    #[case::second_attempt(2, 200)]
    #[case::third_attempt(3, 400)]
    #[case::clamped_to_max(6, 1_000)]
    #[case::zero_uses_min(0, 100)]
    fn exponential_backoff_is_clamped(#[case] attempts: u32, #[case] expected_ms: u64) {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_millis(1_000));
        assert_eq!(policy.next_delay(attempts), Duration::from_millis(expected_ms));
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(u32::MAX), DEFAULT_MAX_BACKOFF);
    }

    #[test]
    fn jitter_stays_within_half_and_full_delay() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_millis(1_000));
        for _ in 0..50 {
            let delay = policy.next_delay_with_jitter(2);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(200));
        }
    }
}
