//! Structural criterion checks.
//!
//! Deterministic, no I/O. Judge criteria are not handled here.

use std::borrow::Cow;

use regex::Regex;
use serde_json::Value;

use crate::task::{CriterionCheck, ExecutionResult};

/// Verdict for one structural check.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Verdict {
    Pass,
    Fail(String),
}

/// Run a structural check against `result`.
///
/// # Precondition
/// `check` is not a judge check.
pub(crate) fn run_check(check: &CriterionCheck, result: &ExecutionResult) -> Verdict {
    match check {
        CriterionCheck::Succeeded => verdict(result.success, || "execution reported failure".to_string()),
        CriterionCheck::OutputNonEmpty => verdict(result.has_output(), || "output is empty".to_string()),
        CriterionCheck::OutputContains { text } => {
            verdict(result.output_text().contains(text.as_str()), || {
                format!("output does not contain '{}'", text)
            })
        }
        CriterionCheck::OutputMatches { pattern } => match Regex::new(pattern) {
            Ok(re) => verdict(re.is_match(&result.output_text()), || {
                format!("output does not match /{}/", pattern)
            }),
            Err(e) => Verdict::Fail(format!("invalid pattern /{}/: {}", pattern, e)),
        },
        CriterionCheck::JsonPointerExists { pointer } => {
            verdict(json_view(result).pointer(pointer).is_some(), || {
                format!("output has no value at {}", pointer)
            })
        }
        CriterionCheck::JsonPointerEquals { pointer, value } => {
            match json_view(result).pointer(pointer) {
                Some(actual) if actual == value => Verdict::Pass,
                Some(actual) => Verdict::Fail(format!("{} is {}, expected {}", pointer, actual, value)),
                None => Verdict::Fail(format!("output has no value at {}", pointer)),
            }
        }
        CriterionCheck::ExitCode { code } => match result.exit_code {
            Some(actual) if actual == *code => Verdict::Pass,
            Some(actual) => Verdict::Fail(format!("exit code {} (expected {})", actual, code)),
            None => Verdict::Fail("no exit code reported".to_string()),
        },
        CriterionCheck::MaxDurationMs { ms } => verdict(result.duration_ms <= *ms, || {
            format!("took {}ms (limit {}ms)", result.duration_ms, ms)
        }),
        CriterionCheck::Judge { .. } => Verdict::Fail("judge criteria need a judge".to_string()),
    }
}

fn verdict(ok: bool, reason: impl FnOnce() -> String) -> Verdict {
    if ok {
        Verdict::Pass
    } else {
        Verdict::Fail(reason())
    }
}

/// Output as structured JSON: objects and arrays as-is, and text output
/// parsed when it holds a JSON document.
fn json_view(result: &ExecutionResult) -> Cow<'_, Value> {
    match &result.output {
        Value::Object(map) if !map.contains_key("stdout") => Cow::Borrowed(&result.output),
        Value::Array(_) => Cow::Borrowed(&result.output),
        _ => match serde_json::from_str::<Value>(result.output_text().trim()) {
            Ok(parsed) if parsed.is_object() || parsed.is_array() => Cow::Owned(parsed),
            _ => Cow::Borrowed(&result.output),
        },
    }
}
