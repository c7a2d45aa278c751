//! Execution results and their provenance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::CapabilitySet;

const TEXT_FIELDS: &[&str] = &["stdout", "contents", "body"];

/// How, when, and under what authorization a result was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// SHA-256 of the action that was run
    pub action_digest: String,
    /// Token presented for the execution
    pub token_id: String,
    pub arm_id: String,
    /// Capabilities the execution actually used (never more than granted)
    pub capabilities_exercised: CapabilitySet,
    /// Whether the sandboxed executor ran the action
    pub sandboxed: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Outcome of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,

    /// Arm or sandbox output
    #[serde(default)]
    pub output: Value,

    /// Process exit code, for command actions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    pub duration_ms: u64,

    /// Cost reported by the arm (cents)
    #[serde(default)]
    pub cost_cents: u64,

    pub provenance: Provenance,
}

impl ExecutionResult {
    /// The output as text: strings verbatim, the text field of sandbox
    /// output (`stdout`, `contents`, or `body`), anything else as compact JSON.
    pub fn output_text(&self) -> String {
        match &self.output {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            Value::Object(map) => TEXT_FIELDS
                .iter()
                .find_map(|field| map.get(*field).and_then(Value::as_str))
                .map(str::to_string)
                .unwrap_or_else(|| self.output.to_string()),
            other => other.to_string(),
        }
    }

    /// Whether there is any meaningful output.
    pub fn has_output(&self) -> bool {
        match &self.output {
            Value::Null => false,
            Value::String(s) => !s.trim().is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Object(_) => !self.output_text().trim().is_empty(),
            _ => true,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::result_with;
    use serde_json::json;

    #[test]
    fn test_output_text() {
        assert_eq!(result_with(json!("hello")).output_text(), "hello");
        assert_eq!(
            result_with(json!({"stdout": "line\n", "stderr": ""})).output_text(),
            "line\n"
        );
        assert_eq!(result_with(json!({"a": 1})).output_text(), r#"{"a":1}"#);
        assert_eq!(result_with(json!(null)).output_text(), "");
    }

    #[test]
    fn test_has_output() {
        assert!(!result_with(json!(null)).has_output());
        assert!(!result_with(json!("  ")).has_output());
        assert!(!result_with(json!({"stdout": ""})).has_output());
        assert!(result_with(json!({"answer": 42})).has_output());
        assert!(result_with(json!(0)).has_output());
    }
}
