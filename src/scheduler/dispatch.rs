//! Dispatch and result handling.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ActiveExecution, Event, Scheduler};
use crate::budget::{BudgetError, RetryDecision};
use crate::error::{FailureKind, OrchestratorError};
use crate::memory::{PriorResult, Recall};
use crate::registry::Arm;
use crate::sandbox::{ExecutionError, SandboxExecutor};
use crate::store::AuditEvent;
use crate::task::{
    AcceptanceCriterion, DispatchRequest, ExecutionResult, IssueSeverity, SubtaskStatus, TaskId,
    ValidationIssue, ValidationResult,
};
use crate::token::CapabilityToken;
use crate::validation::ValidationGate;

/// Prior results attached to each dispatch.
const RECALL_LIMIT: usize = 3;

enum Dispatch {
    Started,
    /// Left in the ready queue (saturated arms or a retry hold)
    Deferred,
    /// Failed or aborted before reaching an arm
    Rejected,
}

/// How a permanently failed step settles.
#[derive(Clone, Copy)]
enum Terminal {
    Blocked,
    TimedOut,
}

impl Scheduler {
    /// Dispatch the ready steps of one task, in queue order.
    pub(super) async fn dispatch_ready(&mut self, task_id: TaskId) -> Result<usize, OrchestratorError> {
        let now = Instant::now();
        let candidates: Vec<u32> = match self.tasks.get(&task_id) {
            Some(rt) => rt
                .graph
                .ready_steps()
                .into_iter()
                .filter(|step| rt.not_before.get(step).map_or(true, |at| *at <= now))
                .collect(),
            None => return Ok(0),
        };

        let mut started = 0;
        let mut changed = false;
        for step in candidates {
            if self.executions.len() >= self.config.max_concurrent_dispatches {
                break;
            }
            match self.try_dispatch(task_id, step).await? {
                Dispatch::Started => {
                    started += 1;
                    changed = true;
                }
                Dispatch::Rejected => changed = true,
                Dispatch::Deferred => {}
            }
            if self.tasks.get(&task_id).map_or(true, |rt| rt.graph.is_settled()) {
                break;
            }
        }
        if changed {
            self.settle_if_done(task_id).await?;
            self.persist(task_id).await?;
        }
        Ok(started)
    }

    /// Select an arm, mint and redeem a token, charge the attempt, and
    /// spawn the execution.
    async fn try_dispatch(&mut self, task_id: TaskId, step: u32) -> Result<Dispatch, OrchestratorError> {
        let Some(rt) = self.tasks.get(&task_id) else {
            return Ok(Dispatch::Deferred);
        };
        let Some(subtask) = rt.graph.subtask(step) else {
            return Ok(Dispatch::Deferred);
        };
        if subtask.status() != SubtaskStatus::Ready {
            return Ok(Dispatch::Deferred);
        }
        let required = match subtask.descriptor().required_capabilities() {
            Ok(required) => required,
            Err(e) => {
                self.fail_before_dispatch(task_id, step, FailureKind::PlanInvalid, e.to_string())
                    .await?;
                return Ok(Dispatch::Rejected);
            }
        };

        let arm_id = match self.registry.select(&required) {
            Ok(Some(arm_id)) => arm_id,
            Ok(None) => {
                debug!(%task_id, step, required = %required, "All capable arms saturated");
                return Ok(Dispatch::Deferred);
            }
            Err(e) => {
                warn!(%task_id, step, error = %e, "No arm for step");
                self.fail_before_dispatch(task_id, step, FailureKind::ArmUnavailable, e.to_string())
                    .await?;
                return Ok(Dispatch::Rejected);
            }
        };
        let (Some(arm), Some(handle)) = (
            self.registry.get(&arm_id).cloned(),
            self.registry.handle(&arm_id),
        ) else {
            return Ok(Dispatch::Deferred);
        };

        let token = match self.issuer.issue_for(task_id, step, required.clone(), &arm) {
            Ok(token) => token,
            Err(e) => {
                warn!(%task_id, step, %arm_id, error = %e, "Token issuance refused");
                self.fail_before_dispatch(task_id, step, FailureKind::CapabilityViolation, e.to_string())
                    .await?;
                return Ok(Dispatch::Rejected);
            }
        };
        if let Err(e) = self.issuer.redeem(&token, &arm_id, &required) {
            warn!(%task_id, step, %arm_id, token_id = %token.id, error = %e, "Token rejected at dispatch");
            self.issuer.revoke(&token.id);
            self.fail_before_dispatch(task_id, step, FailureKind::CapabilityViolation, e.to_string())
                .await?;
            return Ok(Dispatch::Rejected);
        }

        let Some(rt) = self.tasks.get_mut(&task_id) else {
            return Ok(Dispatch::Deferred);
        };
        let budget = rt.graph.contract().budget.clone();
        if let Err(e) = rt.graph.ledger_mut().charge_attempt(&budget) {
            self.issuer.revoke(&token.id);
            self.abort_task(task_id, Some(step), e).await?;
            return Ok(Dispatch::Rejected);
        }

        self.registry.acquire(&arm_id)?;
        rt.graph.take_ready(step);
        rt.not_before.remove(&step);
        let subtask = rt.graph.subtask_mut(step)?;
        subtask.dispatch(&arm_id)?;
        subtask.start_executing()?;

        let attempt = subtask.attempts();
        let description = subtask.descriptor().description.clone();
        let request = DispatchRequest {
            task_id,
            step,
            attempt,
            action: subtask.descriptor().action.clone(),
            attempt_context: subtask.attempt_context().clone(),
            prior_results: Vec::new(),
            limits: subtask.limits().clone(),
        };
        let cancel = rt.cancel.child_token();

        info!(%task_id, step, attempt, %arm_id, action = %request.action.label(), "Dispatched step");
        self.audit(
            AuditEvent::new(task_id, "dispatched")
                .for_step(step)
                .with_detail(json!({
                    "arm_id": arm_id,
                    "attempt": attempt,
                    "token_id": token.id,
                    "granted": token.granted.to_strings(),
                    "wall_clock_ms": request.limits.wall_clock.as_millis() as u64,
                })),
        )
        .await?;

        self.executions.insert(
            (task_id, step),
            ActiveExecution {
                arm_id,
                attempt,
                token_id: token.id.clone(),
                granted: token.granted.clone(),
                cancel: cancel.clone(),
                started: Instant::now(),
            },
        );
        let query = if description.trim().is_empty() {
            request.action.label()
        } else {
            description
        };
        self.spawn_execution(handle, token, request, query, cancel);
        Ok(Dispatch::Started)
    }

    fn spawn_execution(
        &self,
        arm: Arc<dyn Arm>,
        token: CapabilityToken,
        request: DispatchRequest,
        query: String,
        cancel: CancellationToken,
    ) {
        let executor = Arc::clone(&self.executor);
        let recall = self.recall.clone();
        let events = self.events_tx.clone();
        let (task_id, step, attempt) = (request.task_id, request.step, request.attempt);

        tokio::spawn(async move {
            let job = execute(executor, arm, recall, token, request, query, cancel);
            let outcome = match AssertUnwindSafe(job).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => {
                    error!(%task_id, step, "Execution panicked: {:?}", panic);
                    Err(ExecutionError::Failure("execution panicked".to_string()))
                }
            };
            // The receiver only closes when the scheduler is dropped.
            let _ = events.send(Event::Executed { task_id, step, attempt, outcome });
        });
    }

    fn spawn_validation(
        &mut self,
        task_id: TaskId,
        step: u32,
        attempt: u32,
        result: ExecutionResult,
        criteria: Vec<AcceptanceCriterion>,
    ) {
        let gate: ValidationGate = self.gate.clone();
        let events = self.events_tx.clone();
        self.validations.insert((task_id, step), attempt);

        tokio::spawn(async move {
            let verdict = match AssertUnwindSafe(gate.validate(&result, &criteria))
                .catch_unwind()
                .await
            {
                Ok(verdict) => verdict,
                Err(panic) => {
                    error!(%task_id, step, "Validation panicked: {:?}", panic);
                    ValidationResult {
                        valid: false,
                        confidence: 0.0,
                        passed: Vec::new(),
                        failed: Vec::new(),
                        issues: vec![ValidationIssue {
                            severity: IssueSeverity::Critical,
                            category: "validation".to_string(),
                            message: "validator panicked".to_string(),
                            suggestion: None,
                        }],
                    }
                }
            };
            let _ = events.send(Event::Validated { task_id, step, attempt, verdict });
        });
    }

    pub(super) async fn handle_event(&mut self, event: Event) -> Result<(), OrchestratorError> {
        match event {
            Event::Executed { task_id, step, attempt, outcome } => {
                let current = self.executions.get(&(task_id, step)).map(|e| e.attempt);
                if current != Some(attempt) {
                    debug!(%task_id, step, attempt, "Discarding stale execution result");
                    return Ok(());
                }
                self.on_result(task_id, step, outcome).await
            }
            Event::Validated { task_id, step, attempt, verdict } => {
                if self.validations.get(&(task_id, step)) != Some(&attempt) {
                    debug!(%task_id, step, attempt, "Discarding stale validation");
                    return Ok(());
                }
                self.validations.remove(&(task_id, step));
                self.on_validated(task_id, step, verdict).await
            }
        }
    }

    /// Accept the outcome of the execution in flight for `step`.
    ///
    /// The dispatch slot is released and the token revoked whatever the
    /// outcome. A successful result goes to the validation gate; a failure
    /// is retried or settled per the retry policy. Results for steps with
    /// nothing in flight are ignored.
    pub async fn on_result(
        &mut self,
        task_id: TaskId,
        step: u32,
        outcome: Result<ExecutionResult, ExecutionError>,
    ) -> Result<(), OrchestratorError> {
        let Some(active) = self.executions.remove(&(task_id, step)) else {
            debug!(%task_id, step, "No execution in flight; ignoring result");
            return Ok(());
        };
        self.registry.release(&active.arm_id);
        self.issuer.revoke(&active.token_id);
        let elapsed_ms = active.started.elapsed().as_millis() as u64;

        let executing = self
            .tasks
            .get(&task_id)
            .and_then(|rt| rt.graph.subtask(step))
            .is_some_and(|s| s.status() == SubtaskStatus::Executing);
        if !executing {
            return Ok(());
        }

        match outcome {
            Ok(result) => {
                let exercised = &result.provenance.capabilities_exercised;
                if !active.granted.covers(exercised) {
                    let detail = format!(
                        "result claims {} beyond granted {}",
                        active.granted.uncovered(exercised),
                        active.granted
                    );
                    error!(%task_id, step, arm_id = %active.arm_id, %detail, "Capability violation in result");
                    self.fail_permanently(
                        task_id,
                        step,
                        FailureKind::CapabilityViolation,
                        detail,
                        Some(elapsed_ms),
                    )
                    .await?;
                } else {
                    self.registry.record_dispatch_success(&active.arm_id, elapsed_ms);
                    self.accept_result(task_id, step, active.attempt, result).await?;
                }
            }
            Err(e) => {
                let kind = e.kind();
                if matches!(kind, FailureKind::ExecutionFailure | FailureKind::ExecutionTimeout) {
                    self.registry.record_dispatch_failure(&active.arm_id, &e.to_string());
                }
                warn!(%task_id, step, attempt = active.attempt, kind = %kind, error = %e, "Attempt failed");
                self.handle_failure(task_id, step, kind, e.detail(), Some(elapsed_ms))
                    .await?;
            }
        }
        self.settle_if_done(task_id).await?;
        self.persist(task_id).await
    }

    async fn accept_result(
        &mut self,
        task_id: TaskId,
        step: u32,
        attempt: u32,
        result: ExecutionResult,
    ) -> Result<(), OrchestratorError> {
        let Some(rt) = self.tasks.get_mut(&task_id) else {
            return Ok(());
        };
        let budget = rt.graph.contract().budget.clone();
        let spend = rt.graph.ledger_mut().spend(result.cost_cents, &budget);
        let subtask = rt.graph.subtask_mut(step)?;
        subtask.start_validating(result.clone())?;
        let criteria = subtask.descriptor().acceptance_criteria.clone();

        self.audit(
            AuditEvent::new(task_id, "executed")
                .for_step(step)
                .with_detail(json!({
                    "attempt": attempt,
                    "success": result.success,
                    "duration_ms": result.duration_ms,
                    "cost_cents": result.cost_cents,
                    "action_digest": result.provenance.action_digest,
                })),
        )
        .await?;

        match spend {
            Ok(()) => {
                self.spawn_validation(task_id, step, attempt, result, criteria);
                Ok(())
            }
            Err(e) => self.abort_task(task_id, Some(step), e).await,
        }
    }

    async fn on_validated(
        &mut self,
        task_id: TaskId,
        step: u32,
        verdict: ValidationResult,
    ) -> Result<(), OrchestratorError> {
        let Some(rt) = self.tasks.get_mut(&task_id) else {
            return Ok(());
        };
        let validating = rt
            .graph
            .subtask(step)
            .is_some_and(|s| s.status() == SubtaskStatus::Validating);
        if !validating {
            return Ok(());
        }

        if verdict.valid {
            let confidence = verdict.confidence;
            let subtask = rt.graph.subtask_mut(step)?;
            subtask.complete(verdict)?;
            let memory = subtask.result().map(|result| {
                PriorResult::new(
                    task_id,
                    step,
                    subtask.descriptor().description.clone(),
                    &result.output_text(),
                    true,
                )
            });
            let newly_ready = rt.graph.on_completed(step)?;
            info!(%task_id, step, confidence, ?newly_ready, "Step completed");
            self.audit(
                AuditEvent::new(task_id, "completed")
                    .for_step(step)
                    .with_detail(json!({ "confidence": confidence, "newly_ready": newly_ready })),
            )
            .await?;
            if let (Some(recall), Some(entry)) = (&self.recall, memory) {
                remember(recall.as_ref(), entry).await;
            }
        } else {
            let feedback = verdict.feedback();
            warn!(%task_id, step, confidence = verdict.confidence, %feedback, "Validation rejected result");
            rt.graph.subtask_mut(step)?.record_validation(verdict);
            self.handle_failure(task_id, step, FailureKind::ValidationFailure, feedback, None)
                .await?;
        }
        self.settle_if_done(task_id).await?;
        self.persist(task_id).await
    }

    /// Record a failed attempt and apply the retry decision.
    async fn handle_failure(
        &mut self,
        task_id: TaskId,
        step: u32,
        kind: FailureKind,
        detail: String,
        duration_ms: Option<u64>,
    ) -> Result<(), OrchestratorError> {
        self.fail_step(task_id, step, kind, detail.clone(), duration_ms).await?;

        let policy = self.config.retry.clone();
        let Some(rt) = self.tasks.get_mut(&task_id) else {
            return Ok(());
        };
        let max_retries = rt.graph.contract().budget.max_retries;
        let now = Instant::now();
        let remaining = rt.deadline.saturating_duration_since(now);
        let Some(subtask) = rt.graph.subtask(step) else {
            return Ok(());
        };
        let failures = subtask.failures();
        let timeouts = subtask.consecutive_timeouts();
        let decision = policy.decide(
            kind,
            failures,
            timeouts,
            max_retries,
            subtask.limits(),
            remaining,
        );

        match decision {
            RetryDecision::Retry { delay, limits } => {
                let wall_clock_ms = limits.wall_clock.as_millis() as u64;
                rt.graph.requeue(step, limits)?;
                rt.not_before.insert(step, now + delay);
                info!(
                    %task_id,
                    step,
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    wall_clock_ms,
                    "Retry scheduled"
                );
                self.audit(
                    AuditEvent::new(task_id, "retry_scheduled")
                        .for_step(step)
                        .with_detail(json!({
                            "failures": failures,
                            "delay_ms": delay.as_millis() as u64,
                            "wall_clock_ms": wall_clock_ms,
                        })),
                )
                .await
            }
            RetryDecision::TimeBudgetExhausted => {
                let reason = BudgetError::TimeoutsExhausted { step, timeouts };
                rt.graph
                    .record_failure(FailureKind::BudgetExceeded, Some(step), reason.to_string());
                self.settle_step(task_id, step, FailureKind::BudgetExceeded, Terminal::TimedOut)
                    .await
            }
            RetryDecision::Exhausted => {
                rt.graph.record_failure(
                    kind,
                    Some(step),
                    format!("step {} failed after {} attempts: {}", step, failures, detail),
                );
                self.settle_step(task_id, step, kind, Terminal::Blocked).await
            }
            RetryDecision::Fatal => {
                rt.graph.record_failure(kind, Some(step), detail);
                self.settle_step(task_id, step, kind, Terminal::Blocked).await
            }
        }
    }

    /// Transition the step to Failed and log the attempt.
    async fn fail_step(
        &mut self,
        task_id: TaskId,
        step: u32,
        kind: FailureKind,
        detail: String,
        duration_ms: Option<u64>,
    ) -> Result<(), OrchestratorError> {
        let Some(rt) = self.tasks.get_mut(&task_id) else {
            return Ok(());
        };
        let subtask = rt.graph.subtask_mut(step)?;
        subtask.fail(kind, detail.clone(), duration_ms)?;
        let attempt = subtask.attempts();
        self.audit(
            AuditEvent::new(task_id, "attempt_failed")
                .for_step(step)
                .with_detail(json!({ "attempt": attempt, "kind": kind, "detail": detail })),
        )
        .await
    }

    /// A step that never reached an arm: Ready -> Failed -> Blocked-Failed.
    async fn fail_before_dispatch(
        &mut self,
        task_id: TaskId,
        step: u32,
        kind: FailureKind,
        detail: String,
    ) -> Result<(), OrchestratorError> {
        if let Some(rt) = self.tasks.get_mut(&task_id) {
            rt.graph.take_ready(step);
            rt.not_before.remove(&step);
        }
        self.fail_permanently(task_id, step, kind, detail, None).await
    }

    /// Fail a step with no retry, whatever its kind.
    async fn fail_permanently(
        &mut self,
        task_id: TaskId,
        step: u32,
        kind: FailureKind,
        detail: String,
        duration_ms: Option<u64>,
    ) -> Result<(), OrchestratorError> {
        self.fail_step(task_id, step, kind, detail.clone(), duration_ms).await?;
        if let Some(rt) = self.tasks.get_mut(&task_id) {
            rt.graph.record_failure(kind, Some(step), detail);
        }
        self.settle_step(task_id, step, kind, Terminal::Blocked).await
    }

    /// Settle a Failed step permanently and block everything downstream.
    async fn settle_step(
        &mut self,
        task_id: TaskId,
        step: u32,
        kind: FailureKind,
        terminal: Terminal,
    ) -> Result<(), OrchestratorError> {
        let Some(rt) = self.tasks.get_mut(&task_id) else {
            return Ok(());
        };
        rt.not_before.remove(&step);
        let subtask = rt.graph.subtask_mut(step)?;
        match terminal {
            Terminal::Blocked => subtask.block_failed()?,
            Terminal::TimedOut => subtask.time_out_fatal()?,
        }
        let status = subtask.status();
        let blocked = rt.graph.block_dependents(step)?;
        for blocked_step in &blocked {
            rt.not_before.remove(blocked_step);
        }
        error!(%task_id, step, kind = %kind, status = status.as_str(), ?blocked, "Step failed permanently");
        self.audit(
            AuditEvent::new(task_id, "step_failed")
                .for_step(step)
                .with_detail(json!({ "kind": kind, "status": status, "blocked": blocked })),
        )
        .await
    }

    /// A cost or attempt ceiling was breached: stop the whole task.
    async fn abort_task(
        &mut self,
        task_id: TaskId,
        step: Option<u32>,
        reason: BudgetError,
    ) -> Result<(), OrchestratorError> {
        let Some(rt) = self.tasks.get_mut(&task_id) else {
            return Ok(());
        };
        rt.graph
            .record_failure(FailureKind::BudgetExceeded, step, reason.to_string());
        rt.cancel.cancel();
        rt.not_before.clear();
        let in_flight = rt.graph.abort()?;
        self.stop_in_flight(task_id);
        error!(%task_id, error = %reason, ?in_flight, "Budget exceeded; task aborted");
        self.audit(
            AuditEvent::new(task_id, "aborted")
                .with_detail(json!({ "reason": reason.to_string(), "in_flight": in_flight })),
        )
        .await
    }

    /// Settle every unsettled task whose deadline has passed.
    pub(super) async fn expire_overdue(&mut self) -> Result<(), OrchestratorError> {
        let now = Instant::now();
        let overdue: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|(_, rt)| !rt.graph.is_settled() && rt.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for task_id in overdue {
            let Some(rt) = self.tasks.get_mut(&task_id) else {
                continue;
            };
            rt.cancel.cancel();
            rt.not_before.clear();
            rt.graph
                .record_failure(FailureKind::DeadlineExceeded, None, "task deadline passed");
            let in_flight = rt.graph.expire()?;
            self.stop_in_flight(task_id);
            warn!(%task_id, ?in_flight, "Task deadline passed");
            self.audit(
                AuditEvent::new(task_id, "deadline_exceeded")
                    .with_detail(json!({ "in_flight": in_flight })),
            )
            .await?;
            self.settle_if_done(task_id).await?;
            self.persist(task_id).await?;
        }
        Ok(())
    }

    /// Forget the executions and validations of a task that is being
    /// settled wholesale, returning their slots and tokens.
    pub(super) fn stop_in_flight(&mut self, task_id: TaskId) {
        let keys: Vec<(TaskId, u32)> = self
            .executions
            .keys()
            .filter(|(id, _)| *id == task_id)
            .copied()
            .collect();
        for key in keys {
            if let Some(active) = self.executions.remove(&key) {
                active.cancel.cancel();
                self.registry.release(&active.arm_id);
                self.issuer.revoke(&active.token_id);
            }
        }
        self.validations.retain(|(id, _), _| *id != task_id);
    }

    /// Once every subtask is terminal: revoke leftover tokens and audit the
    /// final status, exactly once.
    pub(super) async fn settle_if_done(&mut self, task_id: TaskId) -> Result<(), OrchestratorError> {
        let Some(rt) = self.tasks.get_mut(&task_id) else {
            return Ok(());
        };
        if rt.settled || !rt.graph.is_settled() {
            return Ok(());
        }
        rt.settled = true;
        rt.not_before.clear();
        let status = rt.graph.status();
        let spent_cents = rt.graph.ledger().spent_cents();
        self.issuer.revoke_task(task_id);
        info!(%task_id, status = status.label(), spent_cents, "Task settled");
        self.audit(
            AuditEvent::new(task_id, "settled")
                .with_detail(json!({ "status": status, "spent_cents": spent_cents })),
        )
        .await
    }
}

/// Body of an execution job: recall, then sandbox or arm.
async fn execute(
    executor: Arc<SandboxExecutor>,
    arm: Arc<dyn Arm>,
    recall: Option<Arc<dyn Recall>>,
    token: CapabilityToken,
    mut request: DispatchRequest,
    query: String,
    cancel: CancellationToken,
) -> Result<ExecutionResult, ExecutionError> {
    if let Some(recall) = &recall {
        match recall.recall(&query, RECALL_LIMIT).await {
            Ok(prior) => request.prior_results = prior,
            Err(e) => warn!(task_id = %request.task_id, step = request.step, error = %e, "Recall failed"),
        }
    }

    if request.action.requires_sandbox() {
        return executor
            .run(&token, &request.action, &request.limits, cancel)
            .await;
    }

    let wall_clock = request.limits.wall_clock;
    tokio::select! {
        result = tokio::time::timeout(wall_clock, arm.invoke(&token, &request)) => {
            result.unwrap_or(Err(ExecutionError::Timeout { after: wall_clock }))
        }
        _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
    }
}

async fn remember(recall: &dyn Recall, entry: PriorResult) {
    if let Err(e) = recall.remember(entry).await {
        warn!(error = %e, "Failed to record result in memory");
    }
}
