//! # Arm Dispatch
//!
//! Orchestration core that turns a decomposed task into dependency-ordered,
//! capability-scoped dispatches to worker arms.
//!
//! This library provides:
//! - A dependency scheduler over a DAG of subtasks (Kahn ready frontier)
//! - A capability registry of arms with health tracking
//! - Signed, single-use capability tokens scoped to each dispatch
//! - A sandboxed executor for untrusted file, process, and network actions
//! - A validation gate that checks every result before it counts
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────┐   plan    ┌──────────────────────────┐
//!        │  Decomposer  │──────────►│        Scheduler         │
//!        └──────────────┘           │  TaskGraph · BudgetLedger│
//!                                   └──┬──────────┬─────────┬──┘
//!                        select arm    │   token  │         │ persist
//!                 ┌────────────────────▼┐ ┌───────▼──────┐ ┌▼──────────┐
//!                 │ CapabilityRegistry  │ │ TokenIssuer  │ │ TaskStore │
//!                 └──────────┬──────────┘ └──────────────┘ └───────────┘
//!                            │
//!              ┌─────────────▼────────────┐
//!              │ Arm (invoke) │ Sandbox   │
//!              └─────────────┬────────────┘
//!                            ▼
//!                    ┌────────────────┐
//!                    │ ValidationGate │
//!                    └────────────────┘
//! ```
//!
//! ## Task Flow
//! 1. A contract and plan are submitted; the plan is validated whole
//! 2. Ready steps are matched to arms and dispatched with scoped tokens
//! 3. Results pass the validation gate or are retried with feedback
//! 4. Completion unlocks dependents; permanent failure blocks them
//! 5. Every transition is persisted and audited
//!
//! ## Modules
//! - `scheduler`: the single owner of task graphs
//! - `task`: contracts, plans, subtasks, and the graph
//! - `registry` / `arms`: arm declarations, health, and HTTP clients
//! - `token`: capability token issuing and verification
//! - `sandbox`: confined execution of untrusted actions
//! - `validation`: acceptance-criteria checks and the judge seam
//! - `store`: durable task snapshots and audit events

pub mod arms;
pub mod budget;
pub mod capability;
pub mod config;
pub mod error;
pub mod memory;
pub mod registry;
pub mod sandbox;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod telemetry;
pub mod token;
pub mod validation;

pub use capability::{Capability, CapabilitySet};
pub use config::Config;
pub use error::{FailureKind, OrchestratorError};
pub use registry::{Arm, ArmCapability, CapabilityRegistry};
pub use scheduler::Scheduler;
pub use task::{Plan, PlanStep, TaskContract, TaskId, TaskOutcome, TaskStatus};
pub use token::{CapabilityToken, TokenIssuer};
