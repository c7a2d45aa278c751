//! Acceptance criteria and validation results.
//!
//! # Design Principles
//! - Prefer structural checks (deterministic, fast)
//! - Free-text criteria are delegated to an external judge
//! - Every criterion is hard unless declared soft; a failed hard criterion
//!   blocks completion

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Checks the validation gate knows how to run.
///
/// # Exhaustive Matching
/// All variants must be handled explicitly - no catch-all allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CriterionCheck {
    /// The execution reported success
    Succeeded,

    /// Output is present and not blank
    OutputNonEmpty,

    /// Output text contains a substring
    OutputContains { text: String },

    /// Output text matches a regex
    OutputMatches { pattern: String },

    /// JSON output has a value at the pointer (RFC 6901)
    JsonPointerExists { pointer: String },

    /// JSON output has exactly this value at the pointer
    JsonPointerEquals { pointer: String, value: Value },

    /// Process exited with this code
    ExitCode { code: i32 },

    /// Execution took at most this long
    MaxDurationMs { ms: u64 },

    /// Free-text criterion for the external judge
    Judge { prompt: String },
}

impl CriterionCheck {
    pub fn is_judge(&self) -> bool {
        matches!(self, Self::Judge { .. })
    }

    fn describe(&self) -> String {
        match self {
            Self::Succeeded => "execution succeeded".to_string(),
            Self::OutputNonEmpty => "output is not empty".to_string(),
            Self::OutputContains { text } => format!("output contains '{}'", text),
            Self::OutputMatches { pattern } => format!("output matches /{}/", pattern),
            Self::JsonPointerExists { pointer } => format!("output has {}", pointer),
            Self::JsonPointerEquals { pointer, value } => format!("output {} == {}", pointer, value),
            Self::ExitCode { code } => format!("exit code is {}", code),
            Self::MaxDurationMs { ms } => format!("finished within {}ms", ms),
            Self::Judge { prompt } => prompt.clone(),
        }
    }
}

fn default_hard() -> bool {
    true
}

/// One condition an output must satisfy.
///
/// Deserializes from a plain string (a hard judge criterion) or from an
/// object with `check`, optional `description`, and optional `hard`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "CriterionRepr")]
pub struct AcceptanceCriterion {
    pub description: String,
    pub check: CriterionCheck,
    #[serde(default = "default_hard")]
    pub hard: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CriterionRepr {
    Text(String),
    Full {
        #[serde(default)]
        description: Option<String>,
        check: CriterionCheck,
        #[serde(default = "default_hard")]
        hard: bool,
    },
}

impl From<CriterionRepr> for AcceptanceCriterion {
    fn from(repr: CriterionRepr) -> Self {
        match repr {
            CriterionRepr::Text(text) => Self::judge(text),
            CriterionRepr::Full { description, check, hard } => Self {
                description: description.unwrap_or_else(|| check.describe()),
                check,
                hard,
            },
        }
    }
}

impl AcceptanceCriterion {
    /// A hard criterion with a generated description.
    pub fn new(check: CriterionCheck) -> Self {
        Self {
            description: check.describe(),
            check,
            hard: true,
        }
    }

    pub fn judge(prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        Self {
            description: prompt.clone(),
            check: CriterionCheck::Judge { prompt },
            hard: true,
        }
    }

    pub fn succeeded() -> Self {
        Self::new(CriterionCheck::Succeeded)
    }

    pub fn output_non_empty() -> Self {
        Self::new(CriterionCheck::OutputNonEmpty)
    }

    pub fn output_contains(text: impl Into<String>) -> Self {
        Self::new(CriterionCheck::OutputContains { text: text.into() })
    }

    pub fn output_matches(pattern: impl Into<String>) -> Self {
        Self::new(CriterionCheck::OutputMatches { pattern: pattern.into() })
    }

    pub fn exit_code(code: i32) -> Self {
        Self::new(CriterionCheck::ExitCode { code })
    }

    /// Mark this criterion as advisory.
    pub fn soft(mut self) -> Self {
        self.hard = false;
        self
    }
}

/// Issue severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// A problem found while validating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: IssueSeverity,
    /// e.g. "criterion", "execution", "judge", "confidence"
    pub category: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// Result of the validation gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    /// 0.0 - 1.0
    pub confidence: f64,
    /// Descriptions of criteria that passed
    pub passed: Vec<String>,
    /// Descriptions of criteria that failed
    pub failed: Vec<String>,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// Single-line summary handed back to the arm on retry.
    pub fn feedback(&self) -> String {
        let mut parts = Vec::new();
        if !self.failed.is_empty() {
            parts.push(format!("unmet criteria: {}", self.failed.join("; ")));
        }
        for issue in &self.issues {
            match &issue.suggestion {
                Some(suggestion) => parts.push(format!("{} ({})", issue.message, suggestion)),
                None => parts.push(issue.message.clone()),
            }
        }
        if parts.is_empty() {
            format!("confidence {:.2}", self.confidence)
        } else {
            parts.join(" | ")
        }
    }
}
