//! Exponential backoff with jitter for failed events.
//!
//! The delay before attempt `k + 1` is `min(cap, base * 2^(k-1))` with a
//! random jitter fraction applied, spreading retries of simultaneously
//! failing events so they do not stampede the queue.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Retry timing policy applied to every failed event.
///
/// The retry *budget* lives on each row (`max_attempts`); this policy only
/// decides how long a row waits between attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Base delay for the exponential backoff.
    pub base_delay: Duration,

    /// Ceiling on the computed delay.
    pub max_delay: Duration,

    /// Jitter fraction (0.0 to 1.0) applied around the computed delay.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following failed attempt `attempt`
    /// (1-based), without jitter.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let multiplier = 2_u32.saturating_pow(exponent);
        std::cmp::min(self.base_delay.saturating_mul(multiplier), self.max_delay)
    }

    /// Jittered delay before the attempt following failed attempt
    /// `attempt`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        apply_jitter(self.base_backoff(attempt), self.jitter_factor)
    }

    /// Absolute time the event becomes eligible again after failed attempt
    /// `attempt` at `now`.
    pub fn next_run_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        let delay = self.backoff_delay(attempt);
        now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(300))
    }
}

/// Randomizes a delay by ±`jitter_factor`. A 10s delay with factor 0.2
/// lands anywhere in 8s to 12s.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped = jitter_factor.clamp(0.0, 1.0);
    let range = duration.as_secs_f64() * clamped;
    let offset = rand::rng().random_range(-range..=range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy { jitter_factor: 0.0, ..Default::default() };

        assert_eq!(policy.base_backoff(1), Duration::from_secs(2));
        assert_eq!(policy.base_backoff(2), Duration::from_secs(4));
        assert_eq!(policy.base_backoff(3), Duration::from_secs(8));
        assert_eq!(policy.base_backoff(4), Duration::from_secs(16));
    }

    #[test]
    fn backoff_capped_at_max_delay() {
        let policy = RetryPolicy { jitter_factor: 0.0, ..Default::default() };

        // 2 * 2^19 seconds is far past the 300s cap.
        assert_eq!(policy.base_backoff(20), Duration::from_secs(300));
        assert_eq!(policy.base_backoff(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn attempt_zero_treated_as_first() {
        let policy = RetryPolicy { jitter_factor: 0.0, ..Default::default() };
        assert_eq!(policy.base_backoff(0), policy.base_backoff(1));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(10);

        for _ in 0..100 {
            let jittered = apply_jitter(base, 0.2);
            assert!(jittered >= Duration::from_secs(8), "too small: {jittered:?}");
            assert!(jittered <= Duration::from_secs(12), "too large: {jittered:?}");
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let base = Duration::from_secs(10);
        assert_eq!(apply_jitter(base, 0.0), base);
    }

    #[test]
    fn next_run_at_is_in_the_future() {
        let policy = RetryPolicy::default();
        let now = Utc::now();

        let next = policy.next_run_at(now, 1);
        assert!(next > now);
    }

    proptest! {
        #[test]
        fn jittered_delay_within_policy_envelope(attempt in 1u32..64, factor in 0.0f64..=1.0) {
            let policy = RetryPolicy { jitter_factor: factor, ..Default::default() };
            let base = policy.base_backoff(attempt);
            let jittered = policy.backoff_delay(attempt);

            let upper = base.as_secs_f64() * (1.0 + factor) + 1e-6;
            let lower = (base.as_secs_f64() * (1.0 - factor) - 1e-6).max(0.0);

            prop_assert!(jittered.as_secs_f64() <= upper);
            prop_assert!(jittered.as_secs_f64() >= lower);
        }

        #[test]
        fn base_backoff_monotonic_until_cap(attempt in 1u32..63) {
            let policy = RetryPolicy { jitter_factor: 0.0, ..Default::default() };
            prop_assert!(policy.base_backoff(attempt + 1) >= policy.base_backoff(attempt));
        }
    }
}
