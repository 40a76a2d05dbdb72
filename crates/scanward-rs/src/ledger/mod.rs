use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::info;

use crate::models::{Task, TaskResults, TaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("task id already exists: {0}")]
    DuplicateTaskId(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task {task_id} cannot move from {from} to {to}")]
    IllegalTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("stored record for {task_id} is unreadable: {reason}")]
    Corrupt { task_id: String, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("results encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Every mutating call refreshes `updated_at`. Status and results change
/// together or not at all.
#[async_trait]
pub trait TaskLedger: Send + Sync {
    async fn create(
        &self,
        task_id: &str,
        command: &str,
        log_file_path: &str,
        comment: &str,
    ) -> Result<(), LedgerError>;

    async fn transition(&self, task_id: &str, next: TaskStatus) -> Result<(), LedgerError>;

    /// Stores `results` and moves the task to `COMPLETED` in one step.
    async fn submit_results(&self, task_id: &str, results: TaskResults)
        -> Result<(), LedgerError>;

    /// `None` when the id is unknown.
    async fn get_status(&self, task_id: &str) -> Result<Option<TaskStatus>, LedgerError>;

    /// `None` when the id is unknown or nothing has been stored yet.
    async fn get_results(&self, task_id: &str) -> Result<Option<TaskResults>, LedgerError>;

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, LedgerError>;
}

#[derive(Clone, Default)]
pub struct MemoryLedger {
    inner: Arc<RwLock<HashMap<String, Task>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

fn advance(task: &mut Task, next: TaskStatus) -> Result<(), LedgerError> {
    if !task.status.can_advance_to(next) {
        return Err(LedgerError::IllegalTransition {
            task_id: task.task_id.clone(),
            from: task.status,
            to: next,
        });
    }
    task.status = next;
    task.updated_at = Utc::now();
    Ok(())
}

#[async_trait]
impl TaskLedger for MemoryLedger {
    async fn create(
        &self,
        task_id: &str,
        command: &str,
        log_file_path: &str,
        comment: &str,
    ) -> Result<(), LedgerError> {
        let mut tasks = self.inner.write().await;
        if tasks.contains_key(task_id) {
            return Err(LedgerError::DuplicateTaskId(task_id.to_string()));
        }
        tasks.insert(
            task_id.to_string(),
            Task::new(task_id, command, log_file_path, comment),
        );
        info!(task_id, comment, log_file_path, "task created");
        Ok(())
    }

    async fn transition(&self, task_id: &str, next: TaskStatus) -> Result<(), LedgerError> {
        let mut tasks = self.inner.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| LedgerError::TaskNotFound(task_id.to_string()))?;
        advance(task, next)?;
        info!(task_id, status = %next, "task status updated");
        Ok(())
    }

    async fn submit_results(
        &self,
        task_id: &str,
        results: TaskResults,
    ) -> Result<(), LedgerError> {
        let mut tasks = self.inner.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| LedgerError::TaskNotFound(task_id.to_string()))?;
        advance(task, TaskStatus::Completed)?;
        task.results = Some(results);
        info!(task_id, "task results submitted");
        Ok(())
    }

    async fn get_status(&self, task_id: &str) -> Result<Option<TaskStatus>, LedgerError> {
        Ok(self.inner.read().await.get(task_id).map(|t| t.status))
    }

    async fn get_results(&self, task_id: &str) -> Result<Option<TaskResults>, LedgerError> {
        Ok(self
            .inner
            .read()
            .await
            .get(task_id)
            .and_then(|t| t.results.clone()))
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, LedgerError> {
        Ok(self.inner.read().await.get(task_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn in_progress(ledger: &MemoryLedger, id: &str) {
        ledger.create(id, "sudo -n true", "./log/x", "test").await.unwrap();
        ledger.transition(id, TaskStatus::InProgress).await.unwrap();
    }

    #[tokio::test]
    async fn created_tasks_start_pending() {
        let ledger = MemoryLedger::new();
        ledger
            .create("t1", "sudo -n nmap", "./log/nmap_t1.xml", "run_nmap")
            .await
            .unwrap();
        assert_eq!(
            ledger.get_status("t1").await.unwrap(),
            Some(TaskStatus::Pending)
        );
        assert_eq!(ledger.get_results("t1").await.unwrap(), None);

        let task = ledger.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.command, "sudo -n nmap");
        assert_eq!(task.comment, "run_nmap");
        assert_eq!(task.created_at, task.updated_at);
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let ledger = MemoryLedger::new();
        ledger.create("t1", "a", "b", "c").await.unwrap();
        let err = ledger.create("t1", "x", "y", "z").await.unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateTaskId(id) if id == "t1"));
        assert_eq!(ledger.get_task("t1").await.unwrap().unwrap().command, "a");
    }

    #[tokio::test]
    async fn unknown_ids_are_reported() {
        let ledger = MemoryLedger::new();
        assert_eq!(ledger.get_status("nope").await.unwrap(), None);
        assert_eq!(ledger.get_results("nope").await.unwrap(), None);
        assert!(matches!(
            ledger.transition("nope", TaskStatus::InProgress).await,
            Err(LedgerError::TaskNotFound(_))
        ));
        assert!(matches!(
            ledger.submit_results("nope", TaskResults::Empty).await,
            Err(LedgerError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn pending_cannot_skip_in_progress() {
        let ledger = MemoryLedger::new();
        ledger.create("t1", "a", "b", "c").await.unwrap();
        for next in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Pending] {
            assert!(matches!(
                ledger.transition("t1", next).await,
                Err(LedgerError::IllegalTransition { from: TaskStatus::Pending, .. })
            ));
        }
        assert!(ledger.submit_results("t1", TaskResults::Empty).await.is_err());
        assert_eq!(ledger.get_status("t1").await.unwrap(), Some(TaskStatus::Pending));
    }

    #[tokio::test]
    async fn terminal_states_reject_further_transitions() {
        let ledger = MemoryLedger::new();
        in_progress(&ledger, "done").await;
        ledger.submit_results("done", TaskResults::Empty).await.unwrap();
        in_progress(&ledger, "broken").await;
        ledger.transition("broken", TaskStatus::Failed).await.unwrap();

        for (id, status) in [("done", TaskStatus::Completed), ("broken", TaskStatus::Failed)] {
            for next in [
                TaskStatus::Pending,
                TaskStatus::InProgress,
                TaskStatus::Completed,
                TaskStatus::Failed,
            ] {
                assert!(matches!(
                    ledger.transition(id, next).await,
                    Err(LedgerError::IllegalTransition { .. })
                ));
            }
            assert_eq!(ledger.get_status(id).await.unwrap(), Some(status));
        }
        assert!(ledger
            .submit_results("broken", TaskResults::Empty)
            .await
            .is_err());
        assert_eq!(ledger.get_results("broken").await.unwrap(), None);
    }

    #[tokio::test]
    async fn submitted_results_complete_the_task() {
        let ledger = MemoryLedger::new();
        in_progress(&ledger, "t1").await;
        let before = ledger.get_task("t1").await.unwrap().unwrap().updated_at;

        let results = TaskResults::Log {
            text: "hello".into(),
            truncated: false,
        };
        ledger.submit_results("t1", results.clone()).await.unwrap();

        let task = ledger.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.results, Some(results));
        assert!(task.updated_at >= before);
    }
}
