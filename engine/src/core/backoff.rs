//! Retry policy and backoff computation.
//!
//! Delay for attempt `n` (1-based) is `min(base * 2^(n-1), max)` with a
//! symmetric jitter of `jitter_ratio` applied afterwards and the result clamped
//! back into `[0, max]`. A retry hint parsed from the failure output can only
//! lengthen the wait.

use std::time::Duration;

use crate::core::classifier::Classification;

/// Limits for retrying retryable failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first. `1` disables retries.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay used as jitter amplitude, within `[0, 1]`.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(800),
            max_delay: Duration::from_secs(8),
            jitter_ratio: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Normalize out-of-range values instead of rejecting them.
    ///
    /// `max_attempts` is at least 1, a `max_delay` below `base_delay` is lifted
    /// to it, and the jitter ratio is clamped into `[0, 1]`.
    pub fn normalized(mut self) -> Self {
        self.max_attempts = self.max_attempts.max(1);
        if self.max_delay < self.base_delay {
            self.max_delay = self.base_delay;
        }
        self.jitter_ratio = if self.jitter_ratio.is_finite() {
            self.jitter_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Delay before jitter for the retry after attempt `attempt`.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.max(1) - 1;
        let factor = 1u64.checked_shl(exp.min(62)).unwrap_or(u64::MAX);
        let millis = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(millis.saturating_mul(factor)).min(self.max_delay)
    }

    /// Apply jitter to `delay` using a uniform draw `unit` from `[0, 1)`.
    pub fn jittered(&self, delay: Duration, unit: f64) -> Duration {
        if self.jitter_ratio <= 0.0 || delay.is_zero() {
            return delay.min(self.max_delay);
        }
        let unit = if unit.is_finite() {
            unit.clamp(0.0, 1.0)
        } else {
            0.5
        };
        let offset = (2.0 * unit - 1.0) * self.jitter_ratio;
        let secs = delay.as_secs_f64() * (1.0 + offset);
        let secs = secs.clamp(0.0, self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }
}

/// Outcome of [`RetryScheduler::next_delay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    pub const GIVE_UP: RetryDecision = RetryDecision {
        should_retry: false,
        delay: Duration::ZERO,
    };
}

/// Decides whether and when a failed attempt is retried.
///
/// The random draw is injected so tests get deterministic delays.
#[derive(Debug, Clone, Copy)]
pub struct RetryScheduler {
    policy: RetryPolicy,
    draw: fn() -> f64,
}

impl RetryScheduler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_draw(policy, rand::random::<f64>)
    }

    pub fn with_draw(policy: RetryPolicy, draw: fn() -> f64) -> Self {
        Self {
            policy: policy.normalized(),
            draw,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Decide the retry for a job that just failed attempt `attempt` (1-based).
    ///
    /// Non-retryable classifications and exhausted budgets give up. Otherwise
    /// the jittered backoff is stretched to at least `hint`.
    pub fn next_delay(
        &self,
        attempt: u32,
        classification: &Classification,
        hint: Option<Duration>,
    ) -> RetryDecision {
        if !classification.retryable || attempt >= self.policy.max_attempts {
            return RetryDecision::GIVE_UP;
        }
        let base = self.policy.base_delay_for(attempt);
        let delay = self.policy.jittered(base, (self.draw)());
        let delay = match hint {
            Some(hint) => delay.max(hint),
            None => delay,
        };
        RetryDecision {
            should_retry: true,
            delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::ErrorCode;

    fn midpoint() -> f64 {
        0.5
    }

    fn low() -> f64 {
        0.0
    }

    fn high() -> f64 {
        0.999_999
    }

    fn retryable() -> Classification {
        Classification::new(ErrorCode::RateLimited, "slow down")
    }

    #[test]
    fn base_delay_doubles_up_to_max() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay_for(1), Duration::from_millis(800));
        assert_eq!(policy.base_delay_for(2), Duration::from_millis(1600));
        assert_eq!(policy.base_delay_for(3), Duration::from_millis(3200));
        assert_eq!(policy.base_delay_for(4), Duration::from_millis(6400));
        assert_eq!(policy.base_delay_for(5), Duration::from_secs(8));
        assert_eq!(policy.base_delay_for(200), Duration::from_secs(8));
    }

    #[test]
    fn midpoint_draw_means_no_jitter() {
        let scheduler = RetryScheduler::with_draw(RetryPolicy::default(), midpoint);
        let decision = scheduler.next_delay(1, &retryable(), None);
        assert!(decision.should_retry);
        assert_eq!(decision.delay, Duration::from_millis(800));
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let policy = RetryPolicy::default();
        let base = Duration::from_millis(1000);
        let lo = policy.jittered(base, low());
        let hi = policy.jittered(base, high());
        assert!(lo >= Duration::from_micros(799_999));
        assert!(lo <= Duration::from_micros(800_001));
        assert!(hi <= Duration::from_millis(1200));
        assert!(hi > Duration::from_millis(1199));
    }

    #[test]
    fn jitter_never_exceeds_max_delay() {
        let policy = RetryPolicy::default();
        let delay = policy.jittered(Duration::from_secs(8), high());
        assert_eq!(delay, Duration::from_secs(8));
    }

    #[test]
    fn hint_only_lengthens_the_wait() {
        let scheduler = RetryScheduler::with_draw(RetryPolicy::default(), midpoint);
        let long = scheduler.next_delay(1, &retryable(), Some(Duration::from_secs(2)));
        assert_eq!(long.delay, Duration::from_secs(2));
        let short = scheduler.next_delay(1, &retryable(), Some(Duration::from_millis(10)));
        assert_eq!(short.delay, Duration::from_millis(800));
    }

    #[test]
    fn gives_up_on_final_attempt() {
        let scheduler = RetryScheduler::with_draw(RetryPolicy::default(), midpoint);
        assert!(scheduler.next_delay(2, &retryable(), None).should_retry);
        assert_eq!(
            scheduler.next_delay(3, &retryable(), None),
            RetryDecision::GIVE_UP
        );
    }

    #[test]
    fn gives_up_on_non_retryable() {
        let scheduler = RetryScheduler::with_draw(RetryPolicy::default(), midpoint);
        let cls = Classification::new(ErrorCode::AccessDenied, "AccessDenied");
        assert_eq!(scheduler.next_delay(1, &cls, None), RetryDecision::GIVE_UP);
    }

    #[test]
    fn single_attempt_policy_never_retries() {
        let policy = RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        };
        let scheduler = RetryScheduler::with_draw(policy, midpoint);
        assert!(!scheduler.next_delay(1, &retryable(), None).should_retry);
    }

    #[test]
    fn normalization_fixes_out_of_range_values() {
        let policy = RetryPolicy {
            max_attempts: 0,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(1),
            jitter_ratio: 3.0,
        }
        .normalized();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.max_delay, Duration::from_secs(2));
        assert!((policy.jitter_ratio - 1.0).abs() < f64::EPSILON);
    }
}
