//! Budget tracking for tasks.
//!
//! A cost breach is only detectable after the fact, so the ledger records
//! it and reports the breach; the scheduler aborts the task on that report.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_max_time_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

/// Declared resource ceilings for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBudget {
    /// Maximum total cost across all attempts (cents); `None` is unbounded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_cents: Option<u64>,

    /// Maximum wall-clock time for the whole task
    #[serde(default = "default_max_time_secs")]
    pub max_time_secs: u64,

    /// Maximum dispatch attempts across all subtasks; `None` is unbounded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    /// Per-subtask retry ceiling
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self {
            max_cost_cents: None,
            max_time_secs: default_max_time_secs(),
            max_attempts: None,
            max_retries: default_max_retries(),
        }
    }
}

impl ResourceBudget {
    pub fn max_time(&self) -> Duration {
        Duration::from_secs(self.max_time_secs)
    }

    pub fn with_max_cost_cents(mut self, cents: u64) -> Self {
        self.max_cost_cents = Some(cents);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_max_time(mut self, max_time: Duration) -> Self {
        self.max_time_secs = max_time.as_secs();
        self
    }
}

/// Consumption recorded against a [`ResourceBudget`].
///
/// # Invariants
/// - `attempts` never exceeds `max_attempts`; a refused charge leaves it unchanged
/// - `spent_cents` includes every reported cost, even one that breaches the ceiling
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetLedger {
    spent_cents: u64,
    attempts: u32,
}

impl BudgetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spent_cents(&self) -> u64 {
        self.spent_cents
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Remaining cost allowance, if bounded.
    pub fn remaining_cents(&self, budget: &ResourceBudget) -> Option<u64> {
        budget
            .max_cost_cents
            .map(|max| max.saturating_sub(self.spent_cents))
    }

    /// Count one more dispatch attempt.
    ///
    /// # Postcondition
    /// On `Ok`, `self.attempts` increases by one.
    ///
    /// # Errors
    /// Returns `BudgetError::AttemptsExhausted` if the ceiling is already reached.
    pub fn charge_attempt(&mut self, budget: &ResourceBudget) -> Result<(), BudgetError> {
        if let Some(limit) = budget.max_attempts {
            if self.attempts >= limit {
                return Err(BudgetError::AttemptsExhausted { limit });
            }
        }
        self.attempts += 1;
        Ok(())
    }

    /// Record cost reported by an execution.
    ///
    /// The cost has already been incurred, so it is always recorded; the
    /// error reports that the ceiling is now breached.
    pub fn spend(&mut self, cents: u64, budget: &ResourceBudget) -> Result<(), BudgetError> {
        self.spent_cents = self.spent_cents.saturating_add(cents);
        match budget.max_cost_cents {
            Some(limit) if self.spent_cents > limit => Err(BudgetError::CostExceeded {
                limit,
                spent: self.spent_cents,
            }),
            _ => Ok(()),
        }
    }
}

/// Errors that can occur during budget operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BudgetError {
    #[error("Cost ceiling of {limit} cents breached ({spent} cents spent)")]
    CostExceeded { limit: u64, spent: u64 },

    #[error("Attempt ceiling of {limit} reached")]
    AttemptsExhausted { limit: u32 },

    #[error("Step {step} timed out {timeouts} consecutive times")]
    TimeoutsExhausted { step: u32, timeouts: u32 },
}
