use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{TaskRecord, TaskStatus};
use crate::error::{ConductorError, Result};

/// Persistence for task records. The real store lives outside this crate.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>>;

    async fn insert(&self, record: TaskRecord) -> Result<()>;

    /// Apply a status transition and return the updated record.
    ///
    /// Errors with `TaskNotFound` for unknown tasks and `InvalidTransition`
    /// when the current status does not allow `status`.
    async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error_code: Option<String>,
        error_message: Option<String>,
    ) -> Result<TaskRecord>;
}

#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<String, TaskRecord>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        Ok(self.tasks.read().await.get(task_id).cloned())
    }

    async fn insert(&self, record: TaskRecord) -> Result<()> {
        self.tasks
            .write()
            .await
            .insert(record.task_id.clone(), record);
        Ok(())
    }

    async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error_code: Option<String>,
        error_message: Option<String>,
    ) -> Result<TaskRecord> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| ConductorError::TaskNotFound(task_id.to_string()))?;

        if !task.status.can_transition_to(status) {
            return Err(ConductorError::InvalidTransition {
                from: task.status.to_string(),
                to: status.to_string(),
            });
        }

        task.status = status;
        task.error_code = error_code;
        task.error_message = error_message;
        task.updated_at = Utc::now();
        Ok(task.clone())
    }
}
