//! In-memory task store (non-persistent).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{AuditEvent, StoreError, TaskStore};
use crate::task::{TaskGraph, TaskId};

#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    graphs: Arc<RwLock<HashMap<TaskId, TaskGraph>>>,
    audit: Arc<RwLock<HashMap<TaskId, Vec<AuditEvent>>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn save_task_graph(&self, graph: &TaskGraph) -> Result<(), StoreError> {
        self.graphs
            .write()
            .await
            .insert(graph.task_id(), graph.clone());
        Ok(())
    }

    async fn load_task_graph(&self, task_id: TaskId) -> Result<Option<TaskGraph>, StoreError> {
        Ok(self.graphs.read().await.get(&task_id).cloned())
    }

    async fn list_task_ids(&self) -> Result<Vec<TaskId>, StoreError> {
        let graphs = self.graphs.read().await;
        let mut entries: Vec<_> = graphs
            .values()
            .map(|graph| (graph.updated_at(), graph.task_id()))
            .collect();
        entries.sort_by(|a, b| b.cmp(a));
        Ok(entries.into_iter().map(|(_, id)| id).collect())
    }

    async fn append_audit(&self, event: AuditEvent) -> Result<(), StoreError> {
        self.audit
            .write()
            .await
            .entry(event.task_id)
            .or_default()
            .push(event);
        Ok(())
    }

    async fn list_audit(&self, task_id: TaskId) -> Result<Vec<AuditEvent>, StoreError> {
        Ok(self
            .audit
            .read()
            .await
            .get(&task_id)
            .cloned()
            .unwrap_or_default())
    }
}
