//! Task lifecycle transitions guarded by the execution lock.
//!
//! Every transition runs as: acquire the task's lock, re-read the task,
//! apply the transition, publish `TaskStatusChanged`, release. The lock is
//! released whatever the outcome. Starting a task that cannot be locked
//! fails it immediately with [`LOCK_ACQUISITION_FAILED`] instead of retrying.

pub mod store;
pub mod task;

use std::sync::Arc;

use crate::error::{ConductorError, Result};
use crate::events::EventPublisher;
use crate::lock::ExecutionLockService;

pub use store::{MemoryTaskStore, TaskStore};
pub use task::{TaskRecord, TaskStatus};

pub const LOCK_ACQUISITION_FAILED: &str = "LOCK_ACQUISITION_FAILED";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied(TaskRecord),
    LockNotAcquired,
    /// The task's current status does not allow the requested transition.
    Rejected { current: TaskStatus },
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }
}

pub struct TaskExecutionCoordinator {
    locks: Arc<ExecutionLockService>,
    store: Arc<dyn TaskStore>,
    publisher: EventPublisher,
}

impl TaskExecutionCoordinator {
    pub fn new(
        locks: Arc<ExecutionLockService>,
        store: Arc<dyn TaskStore>,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            locks,
            store,
            publisher,
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Move a pending task to `IN_PROGRESS`.
    ///
    /// If the lock cannot be acquired the task is marked `FAILED` with
    /// [`LOCK_ACQUISITION_FAILED`] and `LockNotAcquired` is returned.
    pub async fn start_task(&self, task_id: &str) -> Result<TransitionOutcome> {
        let outcome = self
            .transition(task_id, TaskStatus::InProgress, None, None)
            .await?;

        if outcome == TransitionOutcome::LockNotAcquired {
            self.fail_without_lock(task_id).await?;
        }
        Ok(outcome)
    }

    pub async fn complete_task(&self, task_id: &str) -> Result<TransitionOutcome> {
        self.transition(task_id, TaskStatus::Completed, None, None)
            .await
    }

    pub async fn fail_task(
        &self,
        task_id: &str,
        error_code: &str,
        error_message: &str,
    ) -> Result<TransitionOutcome> {
        self.transition(
            task_id,
            TaskStatus::Failed,
            Some(error_code.to_string()),
            Some(error_message.to_string()),
        )
        .await
    }

    pub async fn cancel_task(&self, task_id: &str) -> Result<TransitionOutcome> {
        self.transition(task_id, TaskStatus::Cancelled, None, None)
            .await
    }

    /// Apply one transition under the task's execution lock.
    pub async fn transition(
        &self,
        task_id: &str,
        target: TaskStatus,
        error_code: Option<String>,
        error_message: Option<String>,
    ) -> Result<TransitionOutcome> {
        let Some(lock) = self.locks.acquire(task_id).await else {
            return Ok(TransitionOutcome::LockNotAcquired);
        };

        let result = self
            .apply(task_id, target, error_code, error_message)
            .await;
        self.locks.release(&lock).await;
        result
    }

    async fn apply(
        &self,
        task_id: &str,
        target: TaskStatus,
        error_code: Option<String>,
        error_message: Option<String>,
    ) -> Result<TransitionOutcome> {
        let current = self
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| ConductorError::TaskNotFound(task_id.to_string()))?;

        if !current.status.can_transition_to(target) {
            tracing::info!(
                task_id = %task_id,
                current = %current.status,
                target = %target,
                "Task transition rejected"
            );
            return Ok(TransitionOutcome::Rejected {
                current: current.status,
            });
        }

        let updated = self
            .store
            .update_status(task_id, target, error_code, error_message)
            .await?;
        tracing::info!(task_id = %task_id, from = %current.status, to = %target, "Task transitioned");

        self.announce(current.status, &updated).await;
        Ok(TransitionOutcome::Applied(updated))
    }

    /// Fail-fast path when the lock is held elsewhere. Runs without the lock,
    /// so the store's transition check is the only guard.
    async fn fail_without_lock(&self, task_id: &str) -> Result<()> {
        let Some(current) = self.store.get(task_id).await? else {
            return Err(ConductorError::TaskNotFound(task_id.to_string()));
        };
        if !current.status.can_transition_to(TaskStatus::Failed) {
            tracing::warn!(
                task_id = %task_id,
                current = %current.status,
                "Lock not acquired but task already settled, leaving as is"
            );
            return Ok(());
        }

        let updated = match self
            .store
            .update_status(
                task_id,
                TaskStatus::Failed,
                Some(LOCK_ACQUISITION_FAILED.to_string()),
                Some("Could not acquire task execution lock".to_string()),
            )
            .await
        {
            Ok(updated) => updated,
            Err(ConductorError::InvalidTransition { from, .. }) => {
                tracing::warn!(task_id = %task_id, current = %from, "Task settled concurrently, not failing it");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        tracing::warn!(task_id = %task_id, error_code = LOCK_ACQUISITION_FAILED, "Task failed: lock not acquired");

        self.announce(current.status, &updated).await;
        Ok(())
    }

    async fn announce(&self, previous: TaskStatus, task: &TaskRecord) {
        let previous = previous.to_string();
        let new_status = task.status.to_string();
        // Publish failures are logged by the publisher; the transition stands.
        let _ = self
            .publisher
            .task_status_changed(
                &task.task_id,
                &task.session_id,
                Some(&previous),
                &new_status,
                task.error_code.as_deref(),
                task.error_message.as_deref(),
            )
            .await;
    }
}
