//! Task graph: the DAG of subtasks for one task, with Kahn-style frontier
//! tracking.
//!
//! The graph is also the persisted snapshot: everything needed to resume a
//! task after a restart lives in this struct.
//!
//! # Invariants
//! - `in_degree[i]` equals the number of dependencies of subtask `i` that
//!   are not Completed
//! - A step is in `ready` only while its subtask is in Ready state
//! - A step enters Ready from Pending only when its in-degree reaches zero
//! - Every transitive dependent of a permanently failed step is
//!   BlockedFailed and was never dispatched

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::plan::{Plan, PlanError};
use super::result::ExecutionResult;
use super::subtask::{AttemptContext, SubTask, SubtaskStatus};
use super::task::{TaskContract, TaskError, TaskId, TaskStatus};
use crate::budget::BudgetLedger;
use crate::error::FailureKind;
use crate::sandbox::ResourceLimits;

/// The failure a task reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    /// Step that failed, if the failure belongs to one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    pub detail: String,
    /// Attempt history of the failing step
    #[serde(default)]
    pub history: AttemptContext,
}

/// Final (or current) view of a task for callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Results of every completed step, including siblings of failed branches
    pub results: BTreeMap<u32, ExecutionResult>,
    pub subtask_status: BTreeMap<u32, SubtaskStatus>,
    /// Blocked step -> step whose failure blocked it
    pub blocked_by: BTreeMap<u32, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<TaskFailure>,
    pub spent_cents: u64,
    pub attempts: u32,
}

/// DAG of subtasks plus scheduling state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGraph {
    contract: TaskContract,
    /// Arena in plan order
    subtasks: Vec<SubTask>,
    index: HashMap<u32, usize>,
    /// `dependents[i]` lists arena indices that depend on `i`
    dependents: Vec<Vec<usize>>,
    in_degree: Vec<usize>,
    ready: VecDeque<u32>,
    blocked_by: BTreeMap<u32, u32>,
    ledger: BudgetLedger,
    failure: Option<TaskFailure>,
    cancelled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskGraph {
    /// Validate a plan and build the graph.
    ///
    /// Task-level acceptance criteria are appended to every sink step.
    /// Steps without dependencies start Ready.
    ///
    /// # Errors
    /// Any `PlanError`; a rejected plan produces no graph at all.
    pub fn ingest(
        contract: TaskContract,
        plan: Plan,
        max_steps: usize,
        limits: ResourceLimits,
    ) -> Result<Self, PlanError> {
        plan.validate(max_steps)?;

        let index: HashMap<u32, usize> = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.step, i))
            .collect();
        let n = plan.steps.len();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut in_degree = vec![0usize; n];
        for (i, step) in plan.steps.iter().enumerate() {
            for dep in &step.depends_on {
                if let Some(&d) = index.get(dep) {
                    dependents[d].push(i);
                    in_degree[i] += 1;
                }
            }
        }

        let mut subtasks: Vec<SubTask> = plan
            .steps
            .into_iter()
            .map(|step| SubTask::new(step, limits.clone()))
            .collect();
        for (i, subtask) in subtasks.iter_mut().enumerate() {
            if dependents[i].is_empty() {
                subtask.extend_criteria(&contract.acceptance_criteria);
            }
        }

        let now = Utc::now();
        let mut graph = Self {
            contract,
            subtasks,
            index,
            dependents,
            in_degree,
            ready: VecDeque::new(),
            blocked_by: BTreeMap::new(),
            ledger: BudgetLedger::new(),
            failure: None,
            cancelled: false,
            created_at: now,
            updated_at: now,
        };
        for i in 0..n {
            if graph.in_degree[i] == 0 && graph.subtasks[i].mark_ready().is_ok() {
                let step = graph.subtasks[i].step();
                graph.ready.push_back(step);
            }
        }
        Ok(graph)
    }

    // Getters

    pub fn task_id(&self) -> TaskId {
        self.contract.task_id
    }

    pub fn contract(&self) -> &TaskContract {
        &self.contract
    }

    pub fn subtasks(&self) -> &[SubTask] {
        &self.subtasks
    }

    pub fn subtask(&self, step: u32) -> Option<&SubTask> {
        self.index.get(&step).map(|&i| &self.subtasks[i])
    }

    pub fn subtask_mut(&mut self, step: u32) -> Result<&mut SubTask, TaskError> {
        self.updated_at = Utc::now();
        match self.index.get(&step) {
            Some(&i) => Ok(&mut self.subtasks[i]),
            None => Err(TaskError::UnknownStep(step)),
        }
    }

    pub fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut BudgetLedger {
        &mut self.ledger
    }

    pub fn failure(&self) -> Option<&TaskFailure> {
        self.failure.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// In-degree of a step (dependencies not yet completed).
    pub fn in_degree(&self, step: u32) -> Option<usize> {
        self.index.get(&step).map(|&i| self.in_degree[i])
    }

    /// Ready steps in queue order.
    pub fn ready_steps(&self) -> Vec<u32> {
        self.ready.iter().copied().collect()
    }

    /// Remove a step from the ready queue (it is being dispatched or failed).
    pub fn take_ready(&mut self, step: u32) -> bool {
        match self.ready.iter().position(|&s| s == step) {
            Some(pos) => {
                self.ready.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Steps currently dispatched, executing, or validating.
    pub fn in_flight_steps(&self) -> Vec<u32> {
        self.subtasks
            .iter()
            .filter(|s| s.status().is_in_flight())
            .map(SubTask::step)
            .collect()
    }

    // Frontier updates

    /// Failed -> Ready with new limits, re-entering the queue.
    pub fn requeue(&mut self, step: u32, limits: ResourceLimits) -> Result<(), TaskError> {
        self.subtask_mut(step)?.retry(limits)?;
        self.ready.push_back(step);
        Ok(())
    }

    /// Record completion of `step` and return dependents that became ready.
    ///
    /// # Precondition
    /// The subtask is already Completed.
    pub fn on_completed(&mut self, step: u32) -> Result<Vec<u32>, TaskError> {
        let idx = *self.index.get(&step).ok_or(TaskError::UnknownStep(step))?;
        let mut newly_ready = Vec::new();
        for dep_idx in self.dependents[idx].clone() {
            self.in_degree[dep_idx] = self.in_degree[dep_idx].saturating_sub(1);
            let dependent = &mut self.subtasks[dep_idx];
            if self.in_degree[dep_idx] == 0 && dependent.status() == SubtaskStatus::Pending {
                dependent.mark_ready()?;
                let ready_step = dependent.step();
                self.ready.push_back(ready_step);
                newly_ready.push(ready_step);
            }
        }
        self.updated_at = Utc::now();
        Ok(newly_ready)
    }

    /// Mark every transitive dependent of `step` Blocked-Failed.
    ///
    /// Returns the steps that were blocked by this call.
    pub fn block_dependents(&mut self, step: u32) -> Result<Vec<u32>, TaskError> {
        let root = *self.index.get(&step).ok_or(TaskError::UnknownStep(step))?;
        let mut blocked = Vec::new();
        let mut queue: VecDeque<usize> = self.dependents[root].iter().copied().collect();
        while let Some(idx) = queue.pop_front() {
            let subtask = &mut self.subtasks[idx];
            if subtask.status().is_terminal() {
                continue;
            }
            let blocked_step = subtask.step();
            subtask.block_failed()?;
            self.take_ready(blocked_step);
            self.blocked_by.insert(blocked_step, step);
            blocked.push(blocked_step);
            queue.extend(self.dependents[idx].iter().copied());
        }
        if !blocked.is_empty() {
            debug!(task_id = %self.task_id(), step, ?blocked, "Blocked dependents of failed step");
        }
        self.updated_at = Utc::now();
        Ok(blocked)
    }

    /// Keep the worst failure seen.
    pub fn record_failure(&mut self, kind: FailureKind, step: Option<u32>, detail: impl Into<String>) {
        let worse = self
            .failure
            .as_ref()
            .map_or(true, |current| kind.severity() > current.kind.severity());
        if worse {
            let history = step
                .and_then(|s| self.subtask(s))
                .map(|s| s.attempt_context().clone())
                .unwrap_or_default();
            self.failure = Some(TaskFailure {
                kind,
                step,
                detail: detail.into(),
                history,
            });
        }
        self.updated_at = Utc::now();
    }

    /// Settle every unfinished step as Blocked-Failed.
    ///
    /// Returns the steps that were in flight.
    pub fn abort(&mut self) -> Result<Vec<u32>, TaskError> {
        self.settle_remaining(|subtask| subtask.block_failed(), |subtask| subtask.block_failed())
    }

    /// Deadline passed: in-flight steps become TimedOut-Fatal, the rest
    /// Blocked-Failed. Returns the steps that were in flight.
    pub fn expire(&mut self) -> Result<Vec<u32>, TaskError> {
        self.settle_remaining(|subtask| subtask.time_out_fatal(), |subtask| subtask.block_failed())
    }

    /// Cancel every unfinished step. Completed steps are untouched.
    /// Returns the steps that were in flight.
    pub fn cancel(&mut self) -> Result<Vec<u32>, TaskError> {
        self.cancelled = true;
        self.settle_remaining(
            |subtask| subtask.block_cancelled(),
            |subtask| subtask.block_cancelled(),
        )
    }

    fn settle_remaining(
        &mut self,
        in_flight: impl Fn(&mut SubTask) -> Result<(), TaskError>,
        waiting: impl Fn(&mut SubTask) -> Result<(), TaskError>,
    ) -> Result<Vec<u32>, TaskError> {
        let mut was_in_flight = Vec::new();
        for subtask in self.subtasks.iter_mut() {
            let status = subtask.status();
            if status.is_terminal() {
                continue;
            }
            if status.is_in_flight() {
                in_flight(subtask)?;
                was_in_flight.push(subtask.step());
            } else {
                waiting(subtask)?;
            }
        }
        self.ready.clear();
        self.updated_at = Utc::now();
        Ok(was_in_flight)
    }

    /// After a restart: re-queue steps that were in flight or waiting on a
    /// retry. Returns the re-queued steps.
    pub fn recover_interrupted(&mut self) -> Result<Vec<u32>, TaskError> {
        let mut requeued = Vec::new();
        for subtask in self.subtasks.iter_mut() {
            match subtask.status() {
                s if s.is_in_flight() => subtask.interrupt()?,
                SubtaskStatus::Failed => {
                    let limits = subtask.limits().clone();
                    subtask.retry(limits)?;
                }
                _ => continue,
            }
            requeued.push(subtask.step());
        }
        for step in &requeued {
            if !self.ready.contains(step) {
                self.ready.push_back(*step);
            }
        }
        self.updated_at = Utc::now();
        Ok(requeued)
    }

    // Status

    /// Every subtask is in a terminal state.
    pub fn is_settled(&self) -> bool {
        self.subtasks.iter().all(|s| s.status().is_terminal())
    }

    /// User-visible status: the worst unresolved state.
    pub fn status(&self) -> TaskStatus {
        if self.subtasks.iter().all(|s| s.status() == SubtaskStatus::Completed) {
            return TaskStatus::Completed;
        }
        if let Some(failure) = &self.failure {
            return match failure.kind {
                FailureKind::BudgetExceeded => TaskStatus::BudgetExceeded {
                    reason: failure.detail.clone(),
                },
                FailureKind::DeadlineExceeded => TaskStatus::TimedOut,
                FailureKind::Cancelled => TaskStatus::Cancelled,
                _ => TaskStatus::Failed {
                    reason: failure.detail.clone(),
                },
            };
        }
        if self.cancelled {
            return TaskStatus::Cancelled;
        }
        let started = self
            .subtasks
            .iter()
            .any(|s| s.attempts() > 0 || s.status().is_terminal());
        if started {
            TaskStatus::Running
        } else {
            TaskStatus::Pending
        }
    }

    pub fn outcome(&self) -> TaskOutcome {
        TaskOutcome {
            task_id: self.task_id(),
            status: self.status(),
            results: self
                .subtasks
                .iter()
                .filter(|s| s.status() == SubtaskStatus::Completed)
                .filter_map(|s| s.result().map(|r| (s.step(), r.clone())))
                .collect(),
            subtask_status: self.subtasks.iter().map(|s| (s.step(), s.status())).collect(),
            blocked_by: self.blocked_by.clone(),
            failure: self.failure.clone(),
            spent_cents: self.ledger.spent_cents(),
            attempts: self.ledger.attempts(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::action::Action;
    use crate::task::plan::PlanStep;
    use crate::task::result::fixtures::result_with;
    use crate::task::verification::{AcceptanceCriterion, ValidationResult};
    use serde_json::json;

    fn read(step: u32) -> PlanStep {
        PlanStep::new(step, Action::ReadFile { path: format!("{}.txt", step) })
    }

    fn graph(steps: Vec<PlanStep>) -> TaskGraph {
        let contract = TaskContract::new("test goal").unwrap();
        TaskGraph::ingest(contract, Plan::new(steps), 50, ResourceLimits::default()).unwrap()
    }

    fn pass() -> ValidationResult {
        ValidationResult { valid: true, confidence: 1.0, passed: vec![], failed: vec![], issues: vec![] }
    }

    fn run_to_completion(graph: &mut TaskGraph, step: u32) -> Vec<u32> {
        graph.take_ready(step);
        let st = graph.subtask_mut(step).unwrap();
        st.dispatch("arm").unwrap();
        st.start_executing().unwrap();
        st.start_validating(result_with(json!("done"))).unwrap();
        st.complete(pass()).unwrap();
        graph.on_completed(step).unwrap()
    }

    fn run_to_failure(graph: &mut TaskGraph, step: u32) {
        graph.take_ready(step);
        let st = graph.subtask_mut(step).unwrap();
        st.dispatch("arm").unwrap();
        st.start_executing().unwrap();
        st.fail(FailureKind::ExecutionFailure, "boom", None).unwrap();
        st.block_failed().unwrap();
    }

    #[test]
    fn test_roots_start_ready() {
        let g = graph(vec![read(1), read(2), read(3).depends_on([1, 2])]);
        assert_eq!(g.ready_steps(), vec![1, 2]);
        assert_eq!(g.in_degree(3), Some(2));
        assert_eq!(g.subtask(3).unwrap().status(), SubtaskStatus::Pending);
        assert_eq!(g.status(), TaskStatus::Pending);
    }

    #[test]
    fn test_dependent_ready_only_after_all_dependencies() {
        let mut g = graph(vec![read(1), read(2), read(3).depends_on([1, 2])]);
        assert!(run_to_completion(&mut g, 1).is_empty());
        assert_eq!(g.subtask(3).unwrap().status(), SubtaskStatus::Pending);
        assert_eq!(run_to_completion(&mut g, 2), vec![3]);
        assert_eq!(g.ready_steps(), vec![3]);
        run_to_completion(&mut g, 3);
        assert!(g.is_settled());
        assert_eq!(g.status(), TaskStatus::Completed);
        assert_eq!(g.outcome().results.len(), 3);
    }

    #[test]
    fn test_failure_blocks_transitive_dependents() {
        let mut g = graph(vec![
            read(1),
            read(2),
            read(3).depends_on([1, 2]),
            read(4).depends_on([3]),
        ]);
        run_to_completion(&mut g, 1);
        run_to_failure(&mut g, 2);
        let blocked = g.block_dependents(2).unwrap();
        assert_eq!(blocked, vec![3, 4]);
        for step in [3, 4] {
            let st = g.subtask(step).unwrap();
            assert_eq!(st.status(), SubtaskStatus::BlockedFailed);
            assert_eq!(st.attempts(), 0);
        }
        g.record_failure(FailureKind::ExecutionFailure, Some(2), "boom");
        assert!(g.is_settled());
        let outcome = g.outcome();
        assert!(matches!(outcome.status, TaskStatus::Failed { .. }));
        assert!(outcome.results.contains_key(&1));
        assert_eq!(outcome.blocked_by.get(&4), Some(&2));
        assert_eq!(outcome.failure.unwrap().history.records.len(), 1);
    }

    #[test]
    fn test_worst_failure_wins() {
        let mut g = graph(vec![read(1)]);
        g.record_failure(FailureKind::BudgetExceeded, Some(1), "timeouts");
        g.record_failure(FailureKind::ExecutionFailure, Some(1), "later");
        assert!(matches!(g.status(), TaskStatus::BudgetExceeded { .. }));
    }

    #[test]
    fn test_sink_steps_get_task_criteria() {
        let contract = TaskContract::new("goal")
            .unwrap()
            .with_acceptance_criteria(vec![AcceptanceCriterion::output_non_empty()]);
        let plan = Plan::new(vec![read(1), read(2).depends_on([1])]);
        let g = TaskGraph::ingest(contract, plan, 50, ResourceLimits::default()).unwrap();
        assert!(g.subtask(1).unwrap().descriptor().acceptance_criteria.is_empty());
        assert_eq!(g.subtask(2).unwrap().descriptor().acceptance_criteria.len(), 1);
    }

    #[test]
    fn test_cancel_keeps_completed() {
        let mut g = graph(vec![read(1), read(2).depends_on([1]), read(3)]);
        run_to_completion(&mut g, 1);
        g.take_ready(3);
        g.subtask_mut(3).unwrap().dispatch("arm").unwrap();
        let in_flight = g.cancel().unwrap();
        assert_eq!(in_flight, vec![3]);
        assert_eq!(g.subtask(1).unwrap().status(), SubtaskStatus::Completed);
        assert_eq!(g.subtask(2).unwrap().status(), SubtaskStatus::BlockedCancelled);
        assert_eq!(g.status(), TaskStatus::Cancelled);
        assert!(g.ready_steps().is_empty());
    }

    #[test]
    fn test_recover_requeues_in_flight() {
        let mut g = graph(vec![read(1)]);
        g.take_ready(1);
        g.subtask_mut(1).unwrap().dispatch("arm").unwrap();
        let snapshot = serde_json::to_string(&g).unwrap();
        let mut restored: TaskGraph = serde_json::from_str(&snapshot).unwrap();
        assert_eq!(restored.recover_interrupted().unwrap(), vec![1]);
        assert_eq!(restored.ready_steps(), vec![1]);
        assert_eq!(restored.subtask(1).unwrap().status(), SubtaskStatus::Ready);
    }
}
