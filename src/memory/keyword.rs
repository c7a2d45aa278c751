//! Keyword-overlap recall held in memory.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{PriorResult, Recall};

/// Default number of entries kept before the oldest are evicted.
const DEFAULT_CAPACITY: usize = 1000;

/// Scores entries by the share of query words found in their description
/// and summary.
pub struct InMemoryRecall {
    entries: RwLock<Vec<PriorResult>>,
    capacity: usize,
}

impl Default for InMemoryRecall {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl InMemoryRecall {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl Recall for InMemoryRecall {
    async fn recall(&self, query: &str, limit: usize) -> anyhow::Result<Vec<PriorResult>> {
        let wanted = keywords(query);
        if wanted.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let entries = self.entries.read().await;
        let mut scored: Vec<PriorResult> = entries
            .iter()
            .filter_map(|entry| {
                let mut have = keywords(&entry.description);
                have.extend(keywords(&entry.summary));
                let hits = wanted.intersection(&have).count();
                (hits > 0).then(|| PriorResult {
                    score: hits as f64 / wanted.len() as f64,
                    ..entry.clone()
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.success.cmp(&a.success))
                .then_with(|| b.recorded_at.cmp(&a.recorded_at))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn remember(&self, entry: PriorResult) -> anyhow::Result<()> {
        let mut entries = self.entries.write().await;
        entries.push(entry);
        if entries.len() > self.capacity {
            let excess = entries.len() - self.capacity;
            entries.drain(..excess);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskId;

    fn entry(description: &str, output: &str) -> PriorResult {
        PriorResult::new(TaskId::new(), 1, description, output, true)
    }

    #[tokio::test]
    async fn test_recall_ranks_by_overlap() {
        let recall = InMemoryRecall::default();
        recall.remember(entry("parse the nginx access log", "200 lines")).await.unwrap();
        recall.remember(entry("summarize nginx errors", "3 errors")).await.unwrap();
        recall.remember(entry("resize images", "done")).await.unwrap();

        let hits = recall.recall("parse nginx log", 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].description, "parse the nginx access log");
        assert!((hits[0].score - 1.0).abs() < f64::EPSILON);
        assert!(hits[1].score < hits[0].score);
    }

    #[tokio::test]
    async fn test_recall_limit_and_empty_query() {
        let recall = InMemoryRecall::default();
        for i in 0..5 {
            recall.remember(entry(&format!("fetch report {}", i), "ok")).await.unwrap();
        }
        assert_eq!(recall.recall("fetch report", 2).await.unwrap().len(), 2);
        assert!(recall.recall("a b", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let recall = InMemoryRecall::new(2);
        recall.remember(entry("first alpha", "")).await.unwrap();
        recall.remember(entry("second beta", "")).await.unwrap();
        recall.remember(entry("third gamma", "")).await.unwrap();
        assert_eq!(recall.len().await, 2);
        assert!(recall.recall("alpha", 5).await.unwrap().is_empty());
    }
}
