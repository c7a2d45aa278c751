//! Retry policy for recoverable subtask failures.
//!
//! Retries are strictly local: only the failed subtask is re-dispatched.
//! Recoverable failures retry with exponential backoff until the subtask has
//! failed `max_retries + 1` times. Timeouts are tracked separately: a run of
//! `max_retries` consecutive timeouts means the subtask cannot finish inside
//! any allocation the budget allows, which is a budget breach rather than an
//! ordinary failure. Each timeout grows the next attempt's wall-clock limit.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FailureKind;
use crate::sandbox::ResourceLimits;

/// Backoff and timeout-growth parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Maximum backoff cap.
    pub max_delay: Duration,
    /// Multiplier per consecutive failure (typically 2.0).
    pub multiplier: f64,
    /// Wall-clock growth applied after a timeout (typically 1.5).
    pub timeout_growth: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            timeout_growth: 1.5,
        }
    }
}

/// What to do after a subtask attempt failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Re-queue after `delay` with the given limits.
    Retry {
        delay: Duration,
        limits: ResourceLimits,
    },
    /// Retry ceiling reached; the subtask is permanently failed.
    Exhausted,
    /// Consecutive timeouts used up the time allowance.
    TimeBudgetExhausted,
    /// The failure kind is never retried.
    Fatal,
}

impl RetryDecision {
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }
}

impl RetryPolicy {
    /// Backoff before retry number `failures` (1-based).
    ///
    /// # Property
    /// `backoff(n) == min(base * multiplier^(n-1), max_delay)`
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = delay_secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Decide the follow-up for a failed attempt.
    ///
    /// # Preconditions
    /// - `failures` counts this failure
    /// - `consecutive_timeouts` counts this failure if it was a timeout
    pub fn decide(
        &self,
        kind: FailureKind,
        failures: u32,
        consecutive_timeouts: u32,
        max_retries: u32,
        current: &ResourceLimits,
        remaining: Duration,
    ) -> RetryDecision {
        if !kind.is_recoverable() {
            return RetryDecision::Fatal;
        }
        if kind == FailureKind::ExecutionTimeout && consecutive_timeouts >= max_retries {
            return RetryDecision::TimeBudgetExhausted;
        }
        if failures > max_retries {
            return RetryDecision::Exhausted;
        }

        let delay = self.backoff(failures);
        let mut limits = current.clone();
        if kind == FailureKind::ExecutionTimeout {
            limits.wall_clock = current.wall_clock.mul_f64(self.timeout_growth.max(1.0));
        }
        let available = remaining.saturating_sub(delay);
        if !available.is_zero() && limits.wall_clock > available {
            limits.wall_clock = available;
        }
        RetryDecision::Retry { delay, limits }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(secs: u64) -> ResourceLimits {
        ResourceLimits::default().with_wall_clock(Duration::from_secs(secs))
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(20), Duration::from_secs(30));
    }

    #[test]
    fn test_fatal_kinds_short_circuit() {
        let policy = RetryPolicy::default();
        let decision = policy.decide(
            FailureKind::CapabilityViolation,
            1,
            0,
            3,
            &limits(10),
            Duration::from_secs(60),
        );
        assert_eq!(decision, RetryDecision::Fatal);
    }

    #[test]
    fn test_failure_exhausts_after_max_retries_plus_one() {
        let policy = RetryPolicy::default();
        for failures in 1..=3 {
            assert!(policy
                .decide(FailureKind::ExecutionFailure, failures, 0, 3, &limits(10), Duration::from_secs(600))
                .is_retry());
        }
        assert_eq!(
            policy.decide(FailureKind::ExecutionFailure, 4, 0, 3, &limits(10), Duration::from_secs(600)),
            RetryDecision::Exhausted
        );
    }

    #[test]
    fn test_timeout_grows_wall_clock_and_is_clamped() {
        let policy = RetryPolicy::default();
        match policy.decide(FailureKind::ExecutionTimeout, 1, 1, 3, &limits(10), Duration::from_secs(60)) {
            RetryDecision::Retry { delay, limits } => {
                assert_eq!(delay, Duration::from_secs(1));
                assert_eq!(limits.wall_clock, Duration::from_secs(15));
            }
            other => panic!("expected retry, got {:?}", other),
        }
        match policy.decide(FailureKind::ExecutionTimeout, 1, 1, 3, &limits(10), Duration::from_secs(9)) {
            RetryDecision::Retry { limits, .. } => {
                assert_eq!(limits.wall_clock, Duration::from_secs(8));
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn test_consecutive_timeouts_exhaust_time_budget() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(FailureKind::ExecutionTimeout, 3, 3, 3, &limits(10), Duration::from_secs(30)),
            RetryDecision::TimeBudgetExhausted
        );
    }
}
