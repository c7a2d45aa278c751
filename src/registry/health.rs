//! Arm health tracking with exponential-backoff cooldown.
//!
//! Two independent signals feed an arm's health:
//! - dispatch outcomes: failures put the arm into cooldown, which ranks it
//!   below healthy peers without removing it
//! - health checks: consecutive unreachable results lead to deregistration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Reported health of an arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArmHealth {
    #[default]
    Healthy,
    Degraded,
    Unreachable,
}

impl std::fmt::Display for ArmHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Backoff configuration for dispatch-failure cooldowns.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Base delay for first failure.
    pub base_delay: Duration,
    /// Maximum backoff cap.
    pub max_delay: Duration,
    /// Multiplier per consecutive failure (typically 2.0).
    pub multiplier: f64,
    /// After this many consecutive failures the cap is raised to
    /// `max_delay × degraded_multiplier`.
    pub circuit_breaker_threshold: u32,
    pub degraded_multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            circuit_breaker_threshold: 5,
            degraded_multiplier: 6.0,
        }
    }
}

impl BackoffConfig {
    /// Cooldown for a given number of consecutive failures (0-based).
    pub fn cooldown_for(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.min(i32::MAX as u32) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let cap = if consecutive_failures >= self.circuit_breaker_threshold {
            self.max_delay.as_secs_f64() * self.degraded_multiplier
        } else {
            self.max_delay.as_secs_f64()
        };
        Duration::from_secs_f64(delay_secs.min(cap).max(0.0))
    }
}

/// Health state for a single arm.
#[derive(Debug, Clone, Default)]
pub struct HealthState {
    /// When the dispatch cooldown expires (None = not cooling down).
    pub cooldown_until: Option<Instant>,
    /// Consecutive dispatch failures.
    pub consecutive_failures: u32,
    /// Consecutive unreachable health checks.
    pub consecutive_unreachable: u32,
    pub last_failure_reason: Option<String>,
    pub last_failure_at: Option<chrono::DateTime<chrono::Utc>>,
    pub total_dispatches: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Sum of recorded latencies in milliseconds (for averages).
    pub total_latency_ms: u64,
}

impl HealthState {
    /// Whether the arm is currently in cooldown.
    pub fn is_in_cooldown(&self) -> bool {
        self.cooldown_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    /// Remaining cooldown duration, if any.
    pub fn remaining_cooldown(&self) -> Option<Duration> {
        self.cooldown_until.and_then(|until| {
            let now = Instant::now();
            (now < until).then(|| until - now)
        })
    }

    pub fn record_success(&mut self, latency_ms: u64) {
        self.total_dispatches += 1;
        self.total_successes += 1;
        self.total_latency_ms = self.total_latency_ms.saturating_add(latency_ms);
        self.consecutive_failures = 0;
        self.cooldown_until = None;
    }

    /// Record a dispatch failure and return the cooldown applied.
    pub fn record_failure(&mut self, reason: &str, backoff: &BackoffConfig) -> Duration {
        self.total_dispatches += 1;
        self.total_failures += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_reason = Some(reason.to_string());
        self.last_failure_at = Some(chrono::Utc::now());
        let cooldown = backoff.cooldown_for(self.consecutive_failures.saturating_sub(1));
        self.cooldown_until = Some(Instant::now() + cooldown);
        cooldown
    }

    pub fn avg_latency_ms(&self) -> Option<f64> {
        (self.total_successes > 0).then(|| self.total_latency_ms as f64 / self.total_successes as f64)
    }
}

/// Serializable snapshot of arm health for callers.
#[derive(Debug, Clone, Serialize)]
pub struct ArmHealthSnapshot {
    pub arm_id: String,
    pub health: ArmHealth,
    pub in_flight: u32,
    pub max_concurrent: u32,
    pub cooldown_remaining_secs: Option<f64>,
    pub consecutive_failures: u32,
    pub consecutive_unreachable: u32,
    pub last_failure_reason: Option<String>,
    pub total_dispatches: u64,
    pub total_successes: u64,
    pub avg_latency_ms: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cooldown_backoff() {
        let config = BackoffConfig::default();
        assert_eq!(config.cooldown_for(0), Duration::from_secs(5));
        assert_eq!(config.cooldown_for(1), Duration::from_secs(10));
        assert_eq!(config.cooldown_for(4), Duration::from_secs(80));
        // Circuit breaker raises the cap: 5 × 2^10 = 5120 → capped at 1800
        assert_eq!(config.cooldown_for(10), Duration::from_secs(1800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_then_success_clears_cooldown() {
        let backoff = BackoffConfig::default();
        let mut state = HealthState::default();
        assert_eq!(state.record_failure("exit 1", &backoff), Duration::from_secs(5));
        assert!(state.is_in_cooldown());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!state.is_in_cooldown());
        state.record_failure("exit 1", &backoff);
        state.record_success(40);
        assert!(!state.is_in_cooldown());
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.avg_latency_ms(), Some(40.0));
    }
}
