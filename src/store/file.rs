//! JSON file-based task store.
//!
//! Layout under the state directory:
//! ```text
//! tasks/<task_id>.json     latest graph snapshot
//! audit/<task_id>.jsonl    one AuditEvent per line
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{AuditEvent, StoreError, TaskStore};
use crate::task::{TaskGraph, TaskId};

#[derive(Clone)]
pub struct FileTaskStore {
    tasks_dir: PathBuf,
    audit_dir: PathBuf,
    persist_lock: Arc<Mutex<()>>,
}

impl FileTaskStore {
    pub async fn new(base_dir: PathBuf) -> Result<Self, StoreError> {
        let tasks_dir = base_dir.join("tasks");
        let audit_dir = base_dir.join("audit");
        fs::create_dir_all(&tasks_dir).await?;
        fs::create_dir_all(&audit_dir).await?;
        Ok(Self {
            tasks_dir,
            audit_dir,
            persist_lock: Arc::new(Mutex::new(())),
        })
    }

    fn graph_path(&self, task_id: TaskId) -> PathBuf {
        self.tasks_dir.join(format!("{}.json", task_id))
    }

    fn audit_path(&self, task_id: TaskId) -> PathBuf {
        self.audit_dir.join(format!("{}.jsonl", task_id))
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn save_task_graph(&self, graph: &TaskGraph) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(graph)?;
        let path = self.graph_path(graph.task_id());
        let tmp_path = path.with_extension("json.tmp");
        let _guard = self.persist_lock.lock().await;
        fs::write(&tmp_path, data).await?;
        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn load_task_graph(&self, task_id: TaskId) -> Result<Option<TaskGraph>, StoreError> {
        match fs::read(self.graph_path(task_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_task_ids(&self) -> Result<Vec<TaskId>, StoreError> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&self.tasks_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(task_id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<TaskId>().ok())
            else {
                continue;
            };
            match self.load_task_graph(task_id).await {
                Ok(Some(graph)) => entries.push((graph.updated_at(), task_id)),
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping unreadable task snapshot {}: {}", path.display(), e),
            }
        }
        entries.sort_by(|a, b| b.cmp(a));
        Ok(entries.into_iter().map(|(_, id)| id).collect())
    }

    async fn append_audit(&self, event: AuditEvent) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        let _guard = self.persist_lock.lock().await;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.audit_path(event.task_id))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn list_audit(&self, task_id: TaskId) -> Result<Vec<AuditEvent>, StoreError> {
        let text = match fs::read_to_string(self.audit_path(task_id)).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut events = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(event) => events.push(event),
                // A crash mid-append leaves at most one partial trailing line
                Err(e) => tracing::warn!(%task_id, "Skipping malformed audit line: {}", e),
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures::sample_graph;

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let graph = sample_graph();
        {
            let store = FileTaskStore::new(dir.path().to_path_buf()).await.unwrap();
            store.save_task_graph(&graph).await.unwrap();
        }
        let reopened = FileTaskStore::new(dir.path().to_path_buf()).await.unwrap();
        let loaded = reopened.load_task_graph(graph.task_id()).await.unwrap().unwrap();
        assert_eq!(loaded.contract().goal, graph.contract().goal);
        assert_eq!(loaded.subtasks().len(), 2);
    }

    #[tokio::test]
    async fn test_partial_audit_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::new(dir.path().to_path_buf()).await.unwrap();
        let task_id = TaskId::new();
        store.append_audit(AuditEvent::new(task_id, "ingested")).await.unwrap();
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(store.audit_path(task_id))
            .await
            .unwrap();
        file.write_all(b"{\"task_id\":").await.unwrap();
        file.flush().await.unwrap();

        let events = store.list_audit(task_id).await.unwrap();
        assert_eq!(events.len(), 1);
    }
}
