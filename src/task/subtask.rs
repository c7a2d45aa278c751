//! Subtask state machine.
//!
//! A subtask is one plan step plus its runtime record: status and status
//! history, attempt counters, the accumulated attempt context, the arm it was
//! last assigned to, the limits for its next attempt, and its latest result.
//!
//! # State machine
//! ```text
//! Pending -> Ready -> Dispatched -> Executing -> Validating -> Completed
//!              ^                                     |
//!              +------------- Failed <---------------+   (bounded retry)
//!
//! any non-terminal -> BlockedFailed | BlockedCancelled
//! in flight or Failed -> TimedOutFatal
//! ```
//!
//! # Invariants
//! - Terminal states (Completed, BlockedFailed, TimedOutFatal,
//!   BlockedCancelled) are never left
//! - `failures <= attempts + interruptions`
//! - The only backward edge is Failed -> Ready

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::plan::PlanStep;
use super::result::ExecutionResult;
use super::task::TaskError;
use super::verification::ValidationResult;
use crate::error::FailureKind;
use crate::sandbox::ResourceLimits;

/// Status of a subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    /// Waiting on dependencies
    Pending,
    /// Every dependency completed; queued for dispatch
    Ready,
    /// Arm selected and token issued
    Dispatched,
    /// Arm or sandbox is running the action
    Executing,
    /// Result is at the validation gate
    Validating,
    Completed,
    /// Last attempt failed; a retry may follow
    Failed,
    /// Permanently failed, or a dependency did
    BlockedFailed,
    /// Timeouts exhausted the time allowance
    TimedOutFatal,
    /// Task was cancelled before this step finished
    BlockedCancelled,
}

impl SubtaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::BlockedFailed | Self::TimedOutFatal | Self::BlockedCancelled
        )
    }

    /// Dispatched, executing, or validating.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Dispatched | Self::Executing | Self::Validating)
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: SubtaskStatus) -> bool {
        use SubtaskStatus::*;
        match (self, next) {
            (Pending, Ready | BlockedFailed | BlockedCancelled) => true,
            (Ready, Dispatched | Failed | BlockedFailed | BlockedCancelled) => true,
            (Dispatched, Executing | Failed | BlockedFailed | TimedOutFatal | BlockedCancelled) => true,
            (Executing, Validating | Failed | BlockedFailed | TimedOutFatal | BlockedCancelled) => true,
            (Validating, Completed | Failed | BlockedFailed | TimedOutFatal | BlockedCancelled) => true,
            (Failed, Ready | BlockedFailed | TimedOutFatal | BlockedCancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Dispatched => "dispatched",
            Self::Executing => "executing",
            Self::Validating => "validating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::BlockedFailed => "blocked_failed",
            Self::TimedOutFatal => "timed_out_fatal",
            Self::BlockedCancelled => "blocked_cancelled",
        }
    }
}

impl std::fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: SubtaskStatus,
    pub to: SubtaskStatus,
    pub at: DateTime<Utc>,
}

/// One failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub kind: FailureKind,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arm_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub at: DateTime<Utc>,
}

/// Failure feedback threaded through retries.
///
/// Persisted with the subtask so a retry after a restart still sees what
/// went wrong before.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttemptContext {
    pub records: Vec<AttemptRecord>,
}

impl AttemptContext {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&AttemptRecord> {
        self.records.last()
    }

    /// Feedback text for the next attempt, oldest first.
    pub fn feedback(&self) -> String {
        self.records
            .iter()
            .map(|r| format!("attempt {} ({}): {}", r.attempt, r.kind, r.detail))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A plan step together with its execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    descriptor: PlanStep,
    status: SubtaskStatus,
    history: Vec<StatusChange>,
    /// Dispatches made so far
    attempts: u32,
    /// Failed attempts (interruptions excluded)
    failures: u32,
    consecutive_timeouts: u32,
    attempt_context: AttemptContext,
    assigned_arm: Option<String>,
    limits: ResourceLimits,
    result: Option<ExecutionResult>,
    validation: Option<ValidationResult>,
}

impl SubTask {
    /// Create a pending subtask.
    ///
    /// # Postconditions
    /// - `status == Pending`
    /// - `attempts == 0`
    pub fn new(descriptor: PlanStep, limits: ResourceLimits) -> Self {
        Self {
            descriptor,
            status: SubtaskStatus::Pending,
            history: Vec::new(),
            attempts: 0,
            failures: 0,
            consecutive_timeouts: 0,
            attempt_context: AttemptContext::default(),
            assigned_arm: None,
            limits,
            result: None,
            validation: None,
        }
    }

    // Getters

    pub fn descriptor(&self) -> &PlanStep {
        &self.descriptor
    }

    pub fn step(&self) -> u32 {
        self.descriptor.step
    }

    pub fn status(&self) -> SubtaskStatus {
        self.status
    }

    pub fn history(&self) -> &[StatusChange] {
        &self.history
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    pub fn attempt_context(&self) -> &AttemptContext {
        &self.attempt_context
    }

    pub fn assigned_arm(&self) -> Option<&str> {
        self.assigned_arm.as_deref()
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn result(&self) -> Option<&ExecutionResult> {
        self.result.as_ref()
    }

    pub fn validation(&self) -> Option<&ValidationResult> {
        self.validation.as_ref()
    }

    /// How many times this step entered `status`.
    pub fn times_entered(&self, status: SubtaskStatus) -> usize {
        self.history.iter().filter(|c| c.to == status).count()
    }

    /// Append task-level criteria (used for sink steps).
    pub(crate) fn extend_criteria(&mut self, criteria: &[super::AcceptanceCriterion]) {
        self.descriptor
            .acceptance_criteria
            .extend(criteria.iter().cloned());
    }

    // Transitions

    fn transition(&mut self, to: SubtaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition_to(to) {
            return Err(TaskError::InvalidTransition {
                step: self.step(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.history.push(StatusChange {
            from: self.status,
            to,
            at: Utc::now(),
        });
        self.status = to;
        Ok(())
    }

    /// Pending -> Ready once every dependency completed.
    pub fn mark_ready(&mut self) -> Result<(), TaskError> {
        self.transition(SubtaskStatus::Ready)
    }

    /// Ready -> Dispatched, counting one attempt.
    ///
    /// # Postcondition
    /// `attempts` increases by one and `assigned_arm == Some(arm_id)`.
    pub fn dispatch(&mut self, arm_id: &str) -> Result<(), TaskError> {
        self.transition(SubtaskStatus::Dispatched)?;
        self.attempts += 1;
        self.assigned_arm = Some(arm_id.to_string());
        Ok(())
    }

    /// Dispatched -> Executing.
    pub fn start_executing(&mut self) -> Result<(), TaskError> {
        self.transition(SubtaskStatus::Executing)
    }

    /// Executing -> Validating, keeping the result.
    pub fn start_validating(&mut self, result: ExecutionResult) -> Result<(), TaskError> {
        self.transition(SubtaskStatus::Validating)?;
        self.result = Some(result);
        Ok(())
    }

    /// Validating -> Completed.
    pub fn complete(&mut self, validation: ValidationResult) -> Result<(), TaskError> {
        self.transition(SubtaskStatus::Completed)?;
        self.validation = Some(validation);
        self.consecutive_timeouts = 0;
        Ok(())
    }

    /// Keep the validation verdict of a rejected result.
    pub fn record_validation(&mut self, validation: ValidationResult) {
        self.validation = Some(validation);
    }

    /// Move to Failed and append the failure to the attempt context.
    ///
    /// # Postconditions
    /// - `failures` increases by one
    /// - `consecutive_timeouts` increases on a timeout, resets otherwise
    pub fn fail(
        &mut self,
        kind: FailureKind,
        detail: impl Into<String>,
        duration_ms: Option<u64>,
    ) -> Result<(), TaskError> {
        self.transition(SubtaskStatus::Failed)?;
        self.failures += 1;
        if kind == FailureKind::ExecutionTimeout {
            self.consecutive_timeouts += 1;
        } else {
            self.consecutive_timeouts = 0;
        }
        self.push_record(kind, detail.into(), duration_ms);
        Ok(())
    }

    /// Failed -> Ready with the limits for the next attempt.
    pub fn retry(&mut self, limits: ResourceLimits) -> Result<(), TaskError> {
        self.transition(SubtaskStatus::Ready)?;
        self.limits = limits;
        Ok(())
    }

    /// Re-queue an attempt that was in flight when the coordinator stopped.
    ///
    /// Goes through Failed so the edge is recorded, without counting a failure.
    pub fn interrupt(&mut self) -> Result<(), TaskError> {
        self.transition(SubtaskStatus::Failed)?;
        self.push_record(
            FailureKind::Interrupted,
            "attempt was in flight when the coordinator stopped".to_string(),
            None,
        );
        self.transition(SubtaskStatus::Ready)
    }

    pub fn block_failed(&mut self) -> Result<(), TaskError> {
        self.transition(SubtaskStatus::BlockedFailed)
    }

    pub fn time_out_fatal(&mut self) -> Result<(), TaskError> {
        self.transition(SubtaskStatus::TimedOutFatal)
    }

    pub fn block_cancelled(&mut self) -> Result<(), TaskError> {
        self.transition(SubtaskStatus::BlockedCancelled)
    }

    fn push_record(&mut self, kind: FailureKind, detail: String, duration_ms: Option<u64>) {
        self.attempt_context.records.push(AttemptRecord {
            attempt: self.attempts,
            kind,
            detail,
            arm_id: self.assigned_arm.clone(),
            duration_ms,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::action::Action;
    use crate::task::result::fixtures::result_with;
    use serde_json::json;

    fn subtask() -> SubTask {
        let step = PlanStep::new(1, Action::ReadFile { path: "a.txt".into() });
        SubTask::new(step, ResourceLimits::default())
    }

    fn passed() -> ValidationResult {
        ValidationResult {
            valid: true,
            confidence: 1.0,
            passed: vec![],
            failed: vec![],
            issues: vec![],
        }
    }

    #[test]
    fn test_happy_path() {
        let mut st = subtask();
        st.mark_ready().unwrap();
        st.dispatch("reader").unwrap();
        st.start_executing().unwrap();
        st.start_validating(result_with(json!("ok"))).unwrap();
        st.complete(passed()).unwrap();
        assert_eq!(st.status(), SubtaskStatus::Completed);
        assert_eq!(st.attempts(), 1);
        assert_eq!(st.assigned_arm(), Some("reader"));
        assert_eq!(st.history().len(), 5);
    }

    #[test]
    fn test_cannot_skip_states() {
        let mut st = subtask();
        assert!(matches!(
            st.dispatch("arm"),
            Err(TaskError::InvalidTransition { step: 1, .. })
        ));
        st.mark_ready().unwrap();
        assert!(st.complete(passed()).is_err());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut st = subtask();
        st.block_failed().unwrap();
        assert!(st.mark_ready().is_err());
        assert!(st.block_cancelled().is_err());
        for status in [
            SubtaskStatus::Completed,
            SubtaskStatus::BlockedFailed,
            SubtaskStatus::TimedOutFatal,
            SubtaskStatus::BlockedCancelled,
        ] {
            assert!(status.is_terminal());
            assert!(!status.can_transition_to(SubtaskStatus::Ready));
        }
    }

    #[test]
    fn test_failure_and_retry_track_context() {
        let mut st = subtask();
        st.mark_ready().unwrap();
        st.dispatch("arm").unwrap();
        st.start_executing().unwrap();
        st.fail(FailureKind::ExecutionTimeout, "took too long", Some(10_000)).unwrap();
        assert_eq!(st.consecutive_timeouts(), 1);
        st.retry(ResourceLimits::default()).unwrap();
        st.dispatch("arm").unwrap();
        st.fail(FailureKind::ExecutionFailure, "exit 1", None).unwrap();
        assert_eq!(st.failures(), 2);
        assert_eq!(st.consecutive_timeouts(), 0);
        assert_eq!(
            st.attempt_context().feedback(),
            "attempt 1 (execution_timeout): took too long\nattempt 2 (execution_failure): exit 1"
        );
    }

    #[test]
    fn test_interrupt_does_not_count_failure() {
        let mut st = subtask();
        st.mark_ready().unwrap();
        st.dispatch("arm").unwrap();
        st.start_executing().unwrap();
        st.interrupt().unwrap();
        assert_eq!(st.status(), SubtaskStatus::Ready);
        assert_eq!(st.failures(), 0);
        assert_eq!(st.attempt_context().last().unwrap().kind, FailureKind::Interrupted);
    }
}
