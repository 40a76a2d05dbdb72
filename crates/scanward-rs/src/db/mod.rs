use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{migrate::Migrator, SqlitePool};
use tracing::info;

use crate::{
    ledger::{LedgerError, TaskLedger},
    models::{Task, TaskResults, TaskStatus},
};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub async fn create_pool(url: &str) -> anyhow::Result<SqlitePool> {
    Ok(SqlitePool::connect(url).await?)
}

pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    MIGRATOR.run(pool).await?;
    Ok(())
}

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    task_id: String,
    command: String,
    log_file_path: String,
    comment: String,
    status: String,
    results: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskRow {
    fn into_task(self) -> Result<Task, LedgerError> {
        let status = parse_status(&self.task_id, &self.status)?;
        let results = self
            .results
            .as_deref()
            .map(serde_json::from_str::<TaskResults>)
            .transpose()?;
        Ok(Task {
            task_id: self.task_id,
            command: self.command,
            log_file_path: self.log_file_path,
            comment: self.comment,
            status,
            results,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn parse_status(task_id: &str, raw: &str) -> Result<TaskStatus, LedgerError> {
    raw.parse::<TaskStatus>().map_err(|e| LedgerError::Corrupt {
        task_id: task_id.to_string(),
        reason: e.to_string(),
    })
}

/// Ledger backed by the `tasks` table. Each transition is a single
/// conditional `UPDATE` guarded on the required predecessor status, so a
/// concurrent reader sees either the old row or the new one.
#[derive(Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Explains why a guarded update touched no row.
    async fn rejection(&self, task_id: &str, to: TaskStatus) -> LedgerError {
        match self.get_status(task_id).await {
            Ok(None) => LedgerError::TaskNotFound(task_id.to_string()),
            Ok(Some(from)) => LedgerError::IllegalTransition {
                task_id: task_id.to_string(),
                from,
                to,
            },
            Err(e) => e,
        }
    }
}

#[async_trait]
impl TaskLedger for SqliteLedger {
    async fn create(
        &self,
        task_id: &str,
        command: &str,
        log_file_path: &str,
        comment: &str,
    ) -> Result<(), LedgerError> {
        let now = Utc::now();
        let inserted = sqlx::query(
            "INSERT INTO tasks(task_id, command, log_file_path, comment, status, results, created_at, updated_at) VALUES(?, ?, ?, ?, ?, NULL, ?, ?)",
        )
        .bind(task_id)
        .bind(command)
        .bind(log_file_path)
        .bind(comment)
        .bind(TaskStatus::Pending.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {
                info!(task_id, comment, log_file_path, "task created");
                Ok(())
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(LedgerError::DuplicateTaskId(task_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn transition(&self, task_id: &str, next: TaskStatus) -> Result<(), LedgerError> {
        let Some(required) = next.predecessor() else {
            return Err(self.rejection(task_id, next).await);
        };

        let updated = sqlx::query(
            "UPDATE tasks SET status = ?, updated_at = ? WHERE task_id = ? AND status = ?",
        )
        .bind(next.as_str())
        .bind(Utc::now())
        .bind(task_id)
        .bind(required.as_str())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(self.rejection(task_id, next).await);
        }
        info!(task_id, status = %next, "task status updated");
        Ok(())
    }

    async fn submit_results(
        &self,
        task_id: &str,
        results: TaskResults,
    ) -> Result<(), LedgerError> {
        let encoded = serde_json::to_string(&results)?;
        let updated = sqlx::query(
            "UPDATE tasks SET status = ?, results = ?, updated_at = ? WHERE task_id = ? AND status = ?",
        )
        .bind(TaskStatus::Completed.as_str())
        .bind(encoded)
        .bind(Utc::now())
        .bind(task_id)
        .bind(TaskStatus::InProgress.as_str())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(self.rejection(task_id, TaskStatus::Completed).await);
        }
        info!(task_id, "task results submitted");
        Ok(())
    }

    async fn get_status(&self, task_id: &str) -> Result<Option<TaskStatus>, LedgerError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM tasks WHERE task_id = ?")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
        status.map(|s| parse_status(task_id, &s)).transpose()
    }

    async fn get_results(&self, task_id: &str) -> Result<Option<TaskResults>, LedgerError> {
        let stored: Option<Option<String>> =
            sqlx::query_scalar("SELECT results FROM tasks WHERE task_id = ?")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
        match stored.flatten() {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, LedgerError> {
        let row = sqlx::query_as::<_, TaskRow>(
            "SELECT task_id, command, log_file_path, comment, status, results, created_at, updated_at FROM tasks WHERE task_id = ?",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TaskRow::into_task).transpose()
    }
}
