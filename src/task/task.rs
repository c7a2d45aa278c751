//! Task contract - the formal specification of one orchestrated goal.
//!
//! # Invariants
//! - `goal` is non-empty after trimming
//! - `task_id` is unique within a store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::verification::AcceptanceCriterion;
use crate::budget::ResourceBudget;

/// Unique identifier for a task.
///
/// # Properties
/// - Globally unique within an execution context
/// - Immutable once created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a new unique task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TaskId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task priority levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// User-visible status of a task.
///
/// Derived from the subtask states: a task reports the worst unresolved
/// subtask state, so a single fatal branch shows as failed even while
/// independent siblings are still finishing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskStatus {
    /// Ingested, nothing dispatched yet
    Pending,
    /// At least one subtask has been dispatched
    Running,
    /// Every subtask completed
    Completed,
    /// A subtask failed permanently
    Failed { reason: String },
    /// A cost, attempt, or timeout ceiling was breached
    BudgetExceeded { reason: String },
    /// The overall task deadline passed
    TimedOut,
    /// The task was cancelled
    Cancelled,
}

impl TaskStatus {
    /// Check if the task status is final.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TaskStatus::Completed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::BudgetExceeded { .. } => "budget_exceeded",
            TaskStatus::TimedOut => "timed_out",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// Formal specification for a task.
///
/// This is the record the scheduler owns for the duration of execution and
/// persists at creation and on every status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContract {
    pub task_id: TaskId,

    /// Natural language goal
    pub goal: String,

    /// Hard constraints (time, cost, safety)
    #[serde(default)]
    pub constraints: Map<String, Value>,

    /// Relevant background information
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    /// Conditions every final output must satisfy
    #[serde(default)]
    pub acceptance_criteria: Vec<AcceptanceCriterion>,

    #[serde(default)]
    pub budget: ResourceBudget,

    /// Absolute deadline; defaults to `created_at + budget.max_time`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<TaskId>,

    /// Tasks that must be Completed before this one may start
    #[serde(default)]
    pub depends_on: Vec<TaskId>,

    /// Tasks waiting on this one
    #[serde(default)]
    pub blocks: Vec<TaskId>,

    #[serde(default)]
    pub metadata: Map<String, Value>,

    pub created_at: DateTime<Utc>,
}

impl TaskContract {
    /// Create a new contract with default budget.
    ///
    /// # Errors
    /// Returns `TaskError::EmptyGoal` if the goal is blank.
    pub fn new(goal: impl Into<String>) -> Result<Self, TaskError> {
        let goal = goal.into();
        if goal.trim().is_empty() {
            return Err(TaskError::EmptyGoal);
        }
        Ok(Self {
            task_id: TaskId::new(),
            goal,
            constraints: Map::new(),
            context: None,
            acceptance_criteria: Vec::new(),
            budget: ResourceBudget::default(),
            deadline: None,
            priority: Priority::default(),
            parent_task_id: None,
            depends_on: Vec::new(),
            blocks: Vec::new(),
            metadata: Map::new(),
            created_at: Utc::now(),
        })
    }

    pub fn with_budget(mut self, budget: ResourceBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Set the deadline relative to now.
    pub fn with_deadline_in(mut self, within: std::time::Duration) -> Self {
        let within = chrono::Duration::from_std(within).unwrap_or(chrono::Duration::MAX);
        self.deadline = Some(Utc::now() + within);
        self
    }

    pub fn with_acceptance_criteria(mut self, criteria: Vec<AcceptanceCriterion>) -> Self {
        self.acceptance_criteria = criteria;
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Add a cross-task dependency.
    pub fn after(mut self, task: TaskId) -> Self {
        self.depends_on.push(task);
        self
    }

    /// The deadline actually in force.
    pub fn effective_deadline(&self) -> DateTime<Utc> {
        self.deadline.unwrap_or_else(|| {
            let max_time = chrono::Duration::from_std(self.budget.max_time())
                .unwrap_or(chrono::Duration::MAX);
            self.created_at + max_time
        })
    }

    /// Time left until the effective deadline (zero once passed).
    pub fn time_remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.effective_deadline() - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}

/// Errors that can occur during task and subtask state operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("Task goal cannot be empty")]
    EmptyGoal,

    #[error("Invalid state transition for step {step} from {from} to {to}")]
    InvalidTransition { step: u32, from: String, to: String },

    #[error("Step {0} not found in task graph")]
    UnknownStep(u32),
}
