//! Durable task storage with pluggable backends.
//!
//! Supports:
//! - `memory`: in-memory storage (non-persistent, for testing)
//! - `file`: one JSON snapshot per task plus a JSONL audit log
//! - `sqlite`: SQLite database with graph snapshots and an audit table
//!
//! Writes are at-least-once: the scheduler persists after every state
//! change and may save the same snapshot more than once.

mod file;
mod memory;
mod sqlite;

pub use file::FileTaskStore;
pub use memory::InMemoryTaskStore;
pub use sqlite::SqliteTaskStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{Config, StoreBackend};
use crate::task::{TaskGraph, TaskId};

/// One entry in a task's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    /// Event name, e.g. `dispatched` or `validation_failed`
    pub event: String,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub detail: Value,
}

impl AuditEvent {
    pub fn new(task_id: TaskId, event: impl Into<String>) -> Self {
        Self {
            task_id,
            step: None,
            event: event.into(),
            at: Utc::now(),
            detail: Value::Null,
        }
    }

    pub fn for_step(mut self, step: u32) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Errors from storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Background task failed: {0}")]
    Join(String),
}

/// Task store trait - implemented by all storage backends.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    /// Insert or replace the snapshot of a task graph.
    async fn save_task_graph(&self, graph: &TaskGraph) -> Result<(), StoreError>;

    async fn load_task_graph(&self, task_id: TaskId) -> Result<Option<TaskGraph>, StoreError>;

    /// Ids of every stored task, most recently updated first.
    async fn list_task_ids(&self) -> Result<Vec<TaskId>, StoreError>;

    async fn append_audit(&self, event: AuditEvent) -> Result<(), StoreError>;

    /// Audit trail of a task in append order.
    async fn list_audit(&self, task_id: TaskId) -> Result<Vec<AuditEvent>, StoreError>;
}

/// Open the backend selected in `config`.
pub async fn open_store(config: &Config) -> Result<Arc<dyn TaskStore>, StoreError> {
    let store: Arc<dyn TaskStore> = match config.store {
        StoreBackend::Memory => Arc::new(InMemoryTaskStore::new()),
        StoreBackend::File => Arc::new(FileTaskStore::new(config.state_dir.clone()).await?),
        StoreBackend::Sqlite => Arc::new(SqliteTaskStore::new(config.state_dir.clone()).await?),
    };
    tracing::info!(backend = ?config.store, persistent = store.is_persistent(), "Task store opened");
    Ok(store)
}
