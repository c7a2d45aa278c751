//! Error taxonomy for the orchestration core.
//!
//! Each component has its own `thiserror` enum; [`OrchestratorError`] is what
//! the scheduler surfaces to callers. [`FailureKind`] is the serializable
//! classification recorded in attempt history and audit events.

use serde::{Deserialize, Serialize};

use crate::budget::BudgetError;
use crate::registry::RegistryError;
use crate::store::StoreError;
use crate::task::{PlanError, TaskError, TaskId};
use crate::token::TokenError;

/// Classification of a subtask or task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed or cyclic plan
    PlanInvalid,
    /// No arm declares the required capabilities, or all are unreachable
    ArmUnavailable,
    /// Token scope insufficient at issuance or at the execution boundary
    CapabilityViolation,
    /// Execution exceeded its wall-clock limit
    ExecutionTimeout,
    /// Execution returned an error or unsuccessful result
    ExecutionFailure,
    /// Output present but acceptance criteria unmet
    ValidationFailure,
    /// Cost, attempt, or timeout ceiling breached
    BudgetExceeded,
    /// Overall task deadline passed
    DeadlineExceeded,
    /// Task was cancelled
    Cancelled,
    /// Execution was in flight when the coordinator stopped
    Interrupted,
}

impl FailureKind {
    /// Whether a bounded local retry may follow this failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ExecutionTimeout
                | Self::ExecutionFailure
                | Self::ValidationFailure
                | Self::Interrupted
        )
    }

    /// Rank used to pick the task-visible failure when several exist.
    /// Higher is worse.
    pub fn severity(&self) -> u8 {
        match self {
            Self::Interrupted => 0,
            Self::Cancelled => 1,
            Self::ExecutionFailure => 2,
            Self::ValidationFailure => 3,
            Self::ExecutionTimeout => 4,
            Self::ArmUnavailable => 5,
            Self::CapabilityViolation => 6,
            Self::PlanInvalid => 7,
            Self::DeadlineExceeded => 8,
            Self::BudgetExceeded => 9,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlanInvalid => "plan_invalid",
            Self::ArmUnavailable => "arm_unavailable",
            Self::CapabilityViolation => "capability_violation",
            Self::ExecutionTimeout => "execution_timeout",
            Self::ExecutionFailure => "execution_failure",
            Self::ValidationFailure => "validation_failure",
            Self::BudgetExceeded => "budget_exceeded",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Cancelled => "cancelled",
            Self::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the scheduler API.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Plan rejected: {0}")]
    PlanInvalid(#[from] PlanError),

    #[error("No arm available for capabilities {required}")]
    ArmUnavailable { required: String },

    #[error("Capability violation: {0}")]
    CapabilityViolation(#[from] TokenError),

    #[error("Budget exceeded: {0}")]
    BudgetExceeded(#[from] BudgetError),

    #[error("Task {0} not found")]
    TaskNotFound(TaskId),

    #[error("Task {task} depends on task {dependency}, which has not completed")]
    DependencyNotMet { task: TaskId, dependency: TaskId },

    #[error("Task {0} cannot make progress: nothing in flight and nothing dispatchable")]
    Stalled(TaskId),

    #[error("Decomposition failed: {0}")]
    Decomposition(String),

    #[error("Invalid state transition: {0}")]
    Transition(#[from] TaskError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl OrchestratorError {
    /// Taxonomy classification, where one applies.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::PlanInvalid(_) => Some(FailureKind::PlanInvalid),
            Self::ArmUnavailable { .. } => Some(FailureKind::ArmUnavailable),
            Self::CapabilityViolation(_) => Some(FailureKind::CapabilityViolation),
            Self::BudgetExceeded(_) => Some(FailureKind::BudgetExceeded),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_kinds() {
        assert!(FailureKind::ExecutionTimeout.is_recoverable());
        assert!(FailureKind::ValidationFailure.is_recoverable());
        assert!(!FailureKind::CapabilityViolation.is_recoverable());
        assert!(!FailureKind::BudgetExceeded.is_recoverable());
        assert!(!FailureKind::ArmUnavailable.is_recoverable());
    }

    #[test]
    fn test_budget_is_worst() {
        assert!(FailureKind::BudgetExceeded.severity() > FailureKind::DeadlineExceeded.severity());
        assert!(FailureKind::ExecutionFailure.severity() > FailureKind::Cancelled.severity());
    }
}
