//! Task module - contracts, plans, subtasks, and the task graph.
//!
//! # Key Concepts
//! - TaskContract: the formal specification of a goal and its budget
//! - Plan: the decomposer's step list, validated whole before scheduling
//! - SubTask: one step plus its state machine and attempt context
//! - TaskGraph: the DAG with Kahn-style ready-frontier tracking

mod action;
mod graph;
mod plan;
mod result;
mod subtask;
mod task;
mod verification;

pub use action::{http_host, Action, ActionError, DispatchRequest};
pub use graph::{TaskFailure, TaskGraph, TaskOutcome};
pub use plan::{Decomposer, Plan, PlanError, PlanStep};
pub use result::{ExecutionResult, Provenance};
pub use subtask::{AttemptContext, AttemptRecord, StatusChange, SubTask, SubtaskStatus};
pub use task::{Priority, TaskContract, TaskError, TaskId, TaskStatus};
pub use verification::{
    AcceptanceCriterion, CriterionCheck, IssueSeverity, ValidationIssue, ValidationResult,
};

#[cfg(test)]
pub(crate) use result::fixtures;
