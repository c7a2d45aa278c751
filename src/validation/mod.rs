//! Validation gate - decides whether a subtask output may be accepted.
//!
//! # Strategy
//! 1. Structural checks first (fast, deterministic)
//! 2. Free-text criteria go to the configured [`Judge`], in one call
//!
//! # Outcome rules
//! - An unsuccessful execution result is never valid
//! - Any failed hard criterion makes the result invalid
//! - Failed soft criteria lower confidence and are reported as issues
//! - Confidence below the configured minimum makes the result invalid
//! - Judge criteria with no judge configured fail when hard, and are
//!   reported as issues when soft

mod checks;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::task::{
    AcceptanceCriterion, CriterionCheck, ExecutionResult, IssueSeverity, ValidationIssue,
    ValidationResult,
};
use checks::{run_check, Verdict};

/// External validator for free-text criteria.
#[async_trait]
pub trait Judge: Send + Sync {
    /// Judge `output` against `criteria`.
    ///
    /// Criteria listed in the returned `failed` are treated as unmet; when
    /// the result is invalid and names no failures, all of them are.
    async fn validate(&self, output: &Value, criteria: &[String]) -> anyhow::Result<ValidationResult>;
}

/// Runs acceptance criteria against execution results.
#[derive(Clone)]
pub struct ValidationGate {
    judge: Option<Arc<dyn Judge>>,
    min_confidence: f64,
}

impl ValidationGate {
    pub fn new(min_confidence: f64) -> Self {
        Self {
            judge: None,
            min_confidence: min_confidence.clamp(0.0, 1.0),
        }
    }

    pub fn with_judge(mut self, judge: Arc<dyn Judge>) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn min_confidence(&self) -> f64 {
        self.min_confidence
    }

    pub async fn validate(
        &self,
        result: &ExecutionResult,
        criteria: &[AcceptanceCriterion],
    ) -> ValidationResult {
        let mut report = Report::default();

        if !result.success {
            report.issues.push(ValidationIssue {
                severity: IssueSeverity::High,
                category: "execution".to_string(),
                message: "execution reported failure".to_string(),
                suggestion: result
                    .exit_code
                    .map(|code| format!("process exited with {}", code)),
            });
        }

        let (judged, structural): (Vec<_>, Vec<_>) =
            criteria.iter().partition(|c| c.check.is_judge());

        for criterion in structural {
            match run_check(&criterion.check, result) {
                Verdict::Pass => report.pass(criterion),
                Verdict::Fail(reason) => report.fail(criterion, reason),
            }
        }

        let mut judge_confidence = 1.0_f64;
        if !judged.is_empty() {
            judge_confidence = self.run_judge(result, &judged, &mut report).await;
        }

        let total = criteria.len();
        let structural_confidence = if total == 0 {
            1.0
        } else {
            report.passed.len() as f64 / total as f64
        };
        let confidence = if result.success {
            structural_confidence.min(judge_confidence)
        } else {
            0.0
        };

        if confidence < self.min_confidence && result.success && !report.hard_failure {
            report.issues.push(ValidationIssue {
                severity: IssueSeverity::Medium,
                category: "confidence".to_string(),
                message: format!(
                    "confidence {:.2} below minimum {:.2}",
                    confidence, self.min_confidence
                ),
                suggestion: None,
            });
        }

        let valid = result.success && !report.hard_failure && confidence >= self.min_confidence;
        debug!(
            valid,
            confidence,
            passed = report.passed.len(),
            failed = report.failed.len(),
            "Validation complete"
        );

        ValidationResult {
            valid,
            confidence,
            passed: report.passed,
            failed: report.failed,
            issues: report.issues,
        }
    }

    /// Send judge criteria to the judge; returns its confidence.
    async fn run_judge(
        &self,
        result: &ExecutionResult,
        judged: &[&AcceptanceCriterion],
        report: &mut Report,
    ) -> f64 {
        let Some(judge) = &self.judge else {
            for criterion in judged {
                report.fail(criterion, "no judge configured".to_string());
            }
            return 1.0;
        };
        if !result.success {
            for criterion in judged {
                report.fail(criterion, "not judged: execution failed".to_string());
            }
            return 0.0;
        }

        let prompts: Vec<String> = judged.iter().map(|c| judge_prompt(c)).collect();
        match judge.validate(&result.output, &prompts).await {
            Ok(verdict) => {
                let reject_all = !verdict.valid && verdict.failed.is_empty();
                for (criterion, prompt) in judged.iter().zip(&prompts) {
                    if reject_all || verdict.failed.contains(prompt) {
                        report.fail(criterion, "judge found it unmet".to_string());
                    } else {
                        report.pass(criterion);
                    }
                }
                report.issues.extend(verdict.issues);
                verdict.confidence.clamp(0.0, 1.0)
            }
            Err(e) => {
                warn!("Judge call failed: {}", e);
                for criterion in judged {
                    report.fail(criterion, format!("judge unavailable: {}", e));
                }
                0.0
            }
        }
    }
}

fn judge_prompt(criterion: &AcceptanceCriterion) -> String {
    match &criterion.check {
        CriterionCheck::Judge { prompt } => prompt.clone(),
        _ => criterion.description.clone(),
    }
}

#[derive(Default)]
struct Report {
    passed: Vec<String>,
    failed: Vec<String>,
    issues: Vec<ValidationIssue>,
    hard_failure: bool,
}

impl Report {
    fn pass(&mut self, criterion: &AcceptanceCriterion) {
        self.passed.push(criterion.description.clone());
    }

    fn fail(&mut self, criterion: &AcceptanceCriterion, reason: String) {
        self.failed.push(criterion.description.clone());
        self.hard_failure |= criterion.hard;
        self.issues.push(ValidationIssue {
            severity: if criterion.hard {
                IssueSeverity::High
            } else {
                IssueSeverity::Low
            },
            category: "criterion".to_string(),
            message: format!("{}: {}", criterion.description, reason),
            suggestion: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::fixtures::result_with;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedJudge {
        failed: Vec<String>,
        confidence: f64,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Judge for ScriptedJudge {
        async fn validate(&self, _output: &Value, criteria: &[String]) -> anyhow::Result<ValidationResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let failed: Vec<String> = criteria
                .iter()
                .filter(|c| self.failed.contains(c))
                .cloned()
                .collect();
            Ok(ValidationResult {
                valid: failed.is_empty(),
                confidence: self.confidence,
                passed: vec![],
                failed,
                issues: vec![],
            })
        }
    }

    struct BrokenJudge;

    #[async_trait]
    impl Judge for BrokenJudge {
        async fn validate(&self, _output: &Value, _criteria: &[String]) -> anyhow::Result<ValidationResult> {
            anyhow::bail!("judge offline")
        }
    }

    fn judge(failed: &[&str], confidence: f64) -> Arc<ScriptedJudge> {
        Arc::new(ScriptedJudge {
            failed: failed.iter().map(|s| s.to_string()).collect(),
            confidence,
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_structural_pass() {
        let gate = ValidationGate::new(0.5);
        let result = result_with(json!({"stdout": "ok\n"}));
        let verdict = gate
            .validate(&result, &[AcceptanceCriterion::succeeded(), AcceptanceCriterion::output_contains("ok")])
            .await;
        assert!(verdict.valid);
        assert_eq!(verdict.confidence, 1.0);
        assert_eq!(verdict.passed.len(), 2);
    }

    #[tokio::test]
    async fn test_unsuccessful_result_is_invalid_without_criteria() {
        let gate = ValidationGate::new(0.0);
        let mut result = result_with(json!("partial"));
        result.success = false;
        let verdict = gate.validate(&result, &[]).await;
        assert!(!verdict.valid);
        assert_eq!(verdict.issues[0].category, "execution");
    }

    #[tokio::test]
    async fn test_hard_failure_invalidates() {
        let gate = ValidationGate::new(0.0);
        let result = result_with(json!("nothing useful"));
        let verdict = gate
            .validate(&result, &[AcceptanceCriterion::output_contains("PASS")])
            .await;
        assert!(!verdict.valid);
        assert_eq!(verdict.failed, vec!["output contains 'PASS'".to_string()]);
        assert!(verdict.feedback().contains("unmet criteria"));
    }

    #[tokio::test]
    async fn test_soft_failure_lowers_confidence() {
        let criteria = [
            AcceptanceCriterion::output_non_empty(),
            AcceptanceCriterion::output_contains("PASS").soft(),
        ];
        let result = result_with(json!("done"));

        let lenient = ValidationGate::new(0.5).validate(&result, &criteria).await;
        assert!(lenient.valid);
        assert_eq!(lenient.confidence, 0.5);
        assert_eq!(lenient.issues[0].severity, IssueSeverity::Low);

        let strict = ValidationGate::new(0.75).validate(&result, &criteria).await;
        assert!(!strict.valid);
        assert!(strict.issues.iter().any(|i| i.category == "confidence"));
    }

    #[tokio::test]
    async fn test_judge_criteria_without_judge() {
        let gate = ValidationGate::new(0.0);
        let result = result_with(json!("a summary"));

        let hard = gate.validate(&result, &[AcceptanceCriterion::judge("is accurate")]).await;
        assert!(!hard.valid);

        let soft = gate
            .validate(&result, &[AcceptanceCriterion::judge("is concise").soft()])
            .await;
        assert!(soft.valid);
        assert_eq!(soft.failed, vec!["is concise".to_string()]);
    }

    #[tokio::test]
    async fn test_judge_batches_and_reports() {
        let scripted = judge(&["cites sources"], 0.9);
        let gate = ValidationGate::new(0.5).with_judge(scripted.clone());
        let result = result_with(json!("a summary"));
        let verdict = gate
            .validate(
                &result,
                &[
                    AcceptanceCriterion::judge("is accurate"),
                    AcceptanceCriterion::judge("cites sources"),
                ],
            )
            .await;
        assert_eq!(scripted.calls.load(Ordering::SeqCst), 1);
        assert!(!verdict.valid);
        assert_eq!(verdict.passed, vec!["is accurate".to_string()]);
        assert_eq!(verdict.failed, vec!["cites sources".to_string()]);
    }

    #[tokio::test]
    async fn test_low_judge_confidence_invalidates() {
        let gate = ValidationGate::new(0.6).with_judge(judge(&[], 0.4));
        let verdict = gate
            .validate(&result_with(json!("x")), &[AcceptanceCriterion::judge("is right")])
            .await;
        assert!(!verdict.valid);
        assert_eq!(verdict.confidence, 0.4);
    }

    #[tokio::test]
    async fn test_judge_error_fails_hard_criteria() {
        let gate = ValidationGate::new(0.0).with_judge(Arc::new(BrokenJudge));
        let verdict = gate
            .validate(&result_with(json!("x")), &[AcceptanceCriterion::judge("is right")])
            .await;
        assert!(!verdict.valid);
        assert!(verdict.issues[0].message.contains("judge unavailable"));
    }
}
