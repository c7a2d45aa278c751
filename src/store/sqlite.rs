//! SQLite-based task store with an audit table.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::{AuditEvent, StoreError, TaskStore};
use crate::task::{TaskGraph, TaskId};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS task_graphs (
    task_id TEXT PRIMARY KEY NOT NULL,
    status TEXT NOT NULL,
    graph_json TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_graphs_updated_at ON task_graphs(updated_at DESC);
CREATE INDEX IF NOT EXISTS idx_task_graphs_status ON task_graphs(status);

CREATE TABLE IF NOT EXISTS audit_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    step INTEGER,
    event TEXT NOT NULL,
    at TEXT NOT NULL,
    detail TEXT
);

CREATE INDEX IF NOT EXISTS idx_audit_task ON audit_events(task_id, id);
"#;

pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    pub async fn new(base_dir: PathBuf) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(&base_dir).await?;
        let db_path = base_dir.join("tasks.db");

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)?;
            conn.execute_batch(SCHEMA)?;
            Ok::<_, StoreError>(conn)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn save_task_graph(&self, graph: &TaskGraph) -> Result<(), StoreError> {
        let task_id = graph.task_id().to_string();
        let status = graph.status().label().to_string();
        let graph_json = serde_json::to_string(graph)?;
        let updated_at = graph.updated_at().to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO task_graphs (task_id, status, graph_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(task_id) DO UPDATE SET
                    status = excluded.status,
                    graph_json = excluded.graph_json,
                    updated_at = excluded.updated_at",
                params![task_id, status, graph_json, updated_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_task_graph(&self, task_id: TaskId) -> Result<Option<TaskGraph>, StoreError> {
        let key = task_id.to_string();
        let json: Option<String> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT graph_json FROM task_graphs WHERE task_id = ?1",
                        params![key],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        json.map(|j| serde_json::from_str(&j))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn list_task_ids(&self) -> Result<Vec<TaskId>, StoreError> {
        let ids: Vec<String> = self
            .with_conn(|conn| {
                let mut stmt =
                    conn.prepare("SELECT task_id FROM task_graphs ORDER BY updated_at DESC")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                Ok(rows.collect::<Result<Vec<String>, _>>()?)
            })
            .await?;
        Ok(ids
            .iter()
            .filter_map(|id| match id.parse::<TaskId>() {
                Ok(task_id) => Some(task_id),
                Err(e) => {
                    tracing::warn!("Skipping task row with bad id '{}': {}", id, e);
                    None
                }
            })
            .collect())
    }

    async fn append_audit(&self, event: AuditEvent) -> Result<(), StoreError> {
        let detail = serde_json::to_string(&event.detail)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO audit_events (task_id, step, event, at, detail)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.task_id.to_string(),
                    event.step,
                    event.event,
                    event.at.to_rfc3339(),
                    detail
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_audit(&self, task_id: TaskId) -> Result<Vec<AuditEvent>, StoreError> {
        let key = task_id.to_string();
        let rows: Vec<(Option<u32>, String, String, Option<String>)> = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT step, event, at, detail FROM audit_events
                     WHERE task_id = ?1 ORDER BY id ASC",
                )?;
                let rows = stmt.query_map(params![key], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        let mut events = Vec::with_capacity(rows.len());
        for (step, event, at, detail) in rows {
            let at = match chrono::DateTime::parse_from_rfc3339(&at) {
                Ok(at) => at.with_timezone(&chrono::Utc),
                Err(e) => {
                    tracing::warn!(%task_id, "Skipping audit row with bad timestamp: {}", e);
                    continue;
                }
            };
            let detail = match detail {
                Some(text) => serde_json::from_str(&text)?,
                None => serde_json::Value::Null,
            };
            events.push(AuditEvent {
                task_id,
                step,
                event,
                at,
                detail,
            });
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures::sample_graph;

    #[tokio::test]
    async fn test_status_column_tracks_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteTaskStore::new(dir.path().to_path_buf()).await.unwrap();
        let mut graph = sample_graph();
        store.save_task_graph(&graph).await.unwrap();
        graph.cancel().unwrap();
        store.save_task_graph(&graph).await.unwrap();

        let key = graph.task_id().to_string();
        let status: String = store
            .with_conn(move |conn| {
                Ok(conn.query_row(
                    "SELECT status FROM task_graphs WHERE task_id = ?1",
                    params![key],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(status, "cancelled");
        assert_eq!(store.list_task_ids().await.unwrap().len(), 1);
    }
}
