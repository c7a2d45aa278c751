//! Recall of prior similar results.
//!
//! The scheduler asks a [`Recall`] for results of earlier subtasks whose
//! descriptions resemble the one being dispatched, and hands them to the arm
//! as part of the [`DispatchRequest`](crate::task::DispatchRequest). Every
//! validated completion is written back with [`Recall::remember`].
//!
//! ```text
//! ┌───────────┐  recall(query)   ┌──────────┐
//! │ Scheduler │ ───────────────▶ │  Recall  │
//! │           │ ◀─────────────── │          │
//! └─────┬─────┘  [PriorResult]   └────▲─────┘
//!       │ remember(entry)             │
//!       └─────────────────────────────┘
//! ```

mod keyword;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::TaskId;

pub use keyword::InMemoryRecall;

/// Longest summary kept per entry, in bytes.
pub const MAX_SUMMARY_BYTES: usize = 2048;

/// A remembered subtask result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorResult {
    pub task_id: TaskId,
    pub step: u32,
    /// Step description the result was produced for
    pub description: String,
    /// Output text, truncated to [`MAX_SUMMARY_BYTES`]
    pub summary: String,
    pub success: bool,
    /// Relevance to the query that returned it (0.0 - 1.0)
    #[serde(default)]
    pub score: f64,
    pub recorded_at: DateTime<Utc>,
}

impl PriorResult {
    pub fn new(task_id: TaskId, step: u32, description: impl Into<String>, output: &str, success: bool) -> Self {
        Self {
            task_id,
            step,
            description: description.into(),
            summary: truncate(output, MAX_SUMMARY_BYTES),
            success,
            score: 0.0,
            recorded_at: Utc::now(),
        }
    }
}

/// Source of prior results.
#[async_trait]
pub trait Recall: Send + Sync {
    /// Up to `limit` entries relevant to `query`, best first.
    async fn recall(&self, query: &str, limit: usize) -> anyhow::Result<Vec<PriorResult>>;

    async fn remember(&self, entry: PriorResult) -> anyhow::Result<()>;
}

/// Truncate on a UTF-8 boundary at or below `max_bytes`.
pub(crate) fn truncate(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc...");
        // 'é' is two bytes; cutting at 2 would split it
        assert_eq!(truncate("aé", 2), "a...");
    }

    #[test]
    fn test_summary_is_bounded() {
        let long = "x".repeat(MAX_SUMMARY_BYTES * 2);
        let entry = PriorResult::new(TaskId::new(), 1, "step", &long, true);
        assert_eq!(entry.summary.len(), MAX_SUMMARY_BYTES + 3);
    }
}
