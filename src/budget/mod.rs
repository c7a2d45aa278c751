//! Budget module - task resource ceilings and retry policy.
//!
//! # Key Concepts
//! - ResourceBudget: the declared cost, time, and attempt ceilings of a task
//! - BudgetLedger: what a task has actually consumed against its budget
//! - RetryPolicy: bounded local retry with exponential backoff

mod budget;
mod retry;

pub use budget::{BudgetError, BudgetLedger, ResourceBudget};
pub use retry::{RetryDecision, RetryPolicy};
