//! Task queue persistence.
//!
//! # Responsibility
//! - Store queue entries and their claim/complete/fail transitions.
//!
//! # Invariants
//! - `claim_next` selects and marks a task inside one IMMEDIATE transaction,
//!   so concurrent claimants never receive the same task.
//! - Claim order is `priority DESC, task_id ASC`.
//! - Tasks with `attempts >= max_attempts` are never claimed.

use crate::model::task::{Task, TaskCounts, TaskId, TaskStatus, TaskType};
use crate::repo::{RepoError, RepoResult};
use rusqlite::{params, Connection, Row, Transaction, TransactionBehavior};

const TASK_SELECT_SQL: &str = "SELECT
    task_id,
    task_type,
    payload,
    priority,
    status,
    attempts,
    max_attempts,
    last_error,
    created_at,
    updated_at
FROM tasks";

const MAX_ERROR_CHARS: usize = 1024;

/// SQLite-backed task repository.
pub struct SqliteTaskRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteTaskRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    pub fn insert(
        &self,
        task_type: TaskType,
        payload: &serde_json::Value,
        priority: i64,
        max_attempts: u32,
    ) -> RepoResult<TaskId> {
        self.conn.execute(
            "INSERT INTO tasks (
                task_type,
                payload,
                priority,
                status,
                max_attempts
            ) VALUES (?1, ?2, ?3, 'pending', ?4);",
            params![task_type.as_str(), payload.to_string(), priority, max_attempts],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Claims the next runnable task of `task_type`.
    pub fn claim_next(&self, task_type: TaskType) -> RepoResult<Option<Task>> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let candidate = {
            let mut stmt = tx.prepare(&format!(
                "{TASK_SELECT_SQL}
                 WHERE task_type = ?1
                   AND status = 'pending'
                   AND attempts < max_attempts
                 ORDER BY priority DESC, task_id ASC
                 LIMIT 1;"
            ))?;
            let mut rows = stmt.query([task_type.as_str()])?;
            match rows.next()? {
                Some(row) => Some(parse_task_row(row)?),
                None => None,
            }
        };

        let Some(mut task) = candidate else {
            tx.commit()?;
            return Ok(None);
        };

        tx.execute(
            "UPDATE tasks
             SET status = 'processing',
                 attempts = attempts + 1,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE task_id = ?1;",
            [task.id],
        )?;
        tx.commit()?;

        task.status = TaskStatus::Processing;
        task.attempts += 1;
        Ok(Some(task))
    }

    /// Marks a task completed. Terminal.
    pub fn complete(&self, id: TaskId) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE tasks
             SET status = 'completed',
                 last_error = NULL,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE task_id = ?1;",
            [id],
        )?;
        if changed == 0 {
            return Err(RepoError::TaskNotFound(id));
        }
        Ok(())
    }

    /// Records a failure and returns the resulting status.
    ///
    /// The task goes back to `pending` while attempts remain, else `failed`.
    pub fn fail(&self, id: TaskId, error: &str) -> RepoResult<TaskStatus> {
        let error = truncate_error(error);
        let changed = self.conn.execute(
            "UPDATE tasks
             SET status = CASE WHEN attempts < max_attempts THEN 'pending' ELSE 'failed' END,
                 last_error = ?2,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE task_id = ?1;",
            params![id, error],
        )?;
        if changed == 0 {
            return Err(RepoError::TaskNotFound(id));
        }
        self.get(id)?
            .map(|task| task.status)
            .ok_or(RepoError::TaskNotFound(id))
    }

    /// Returns every `processing` task to `pending`.
    pub fn recover_processing(&self) -> RepoResult<usize> {
        let changed = self.conn.execute(
            "UPDATE tasks
             SET status = 'pending',
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE status = 'processing';",
            [],
        )?;
        Ok(changed)
    }

    pub fn get(&self, id: TaskId) -> RepoResult<Option<Task>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{TASK_SELECT_SQL} WHERE task_id = ?1;"))?;
        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_task_row(row)?));
        }
        Ok(None)
    }

    pub fn counts(&self) -> RepoResult<TaskCounts> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status;")?;
        let mut rows = stmt.query([])?;
        let mut counts = TaskCounts::default();
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            let count = count.max(0) as u64;
            match TaskStatus::parse(&status) {
                Some(TaskStatus::Pending) => counts.pending = count,
                Some(TaskStatus::Processing) => counts.processing = count,
                Some(TaskStatus::Completed) => counts.completed = count,
                Some(TaskStatus::Failed) => counts.failed = count,
                None => {
                    return Err(RepoError::InvalidData(format!(
                        "invalid task status `{status}` in tasks.status"
                    )))
                }
            }
        }
        Ok(counts)
    }

    /// Deletes completed tasks last touched at or before `cutoff_ms`.
    pub fn purge_completed(&self, cutoff_ms: i64) -> RepoResult<usize> {
        let changed = self.conn.execute(
            "DELETE FROM tasks
             WHERE status = 'completed'
               AND updated_at <= ?1;",
            [cutoff_ms],
        )?;
        Ok(changed)
    }
}

fn truncate_error(error: &str) -> String {
    let flattened = error.replace(['\n', '\r'], " ");
    if flattened.chars().count() <= MAX_ERROR_CHARS {
        return flattened;
    }
    let mut truncated: String = flattened.chars().take(MAX_ERROR_CHARS).collect();
    truncated.push_str("...");
    truncated
}

fn parse_task_row(row: &Row<'_>) -> RepoResult<Task> {
    let type_text: String = row.get("task_type")?;
    let task_type = TaskType::parse(&type_text).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid task type `{type_text}` in tasks.task_type"))
    })?;
    let status_text: String = row.get("status")?;
    let status = TaskStatus::parse(&status_text).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid task status `{status_text}` in tasks.status"))
    })?;
    let payload_text: String = row.get("payload")?;
    let payload = serde_json::from_str(&payload_text).map_err(|err| {
        RepoError::InvalidData(format!("invalid json in tasks.payload: {err}"))
    })?;

    Ok(Task {
        id: row.get("task_id")?,
        task_type,
        payload,
        priority: row.get("priority")?,
        status,
        attempts: row.get("attempts")?,
        max_attempts: row.get("max_attempts")?,
        last_error: row.get("last_error")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::truncate_error;

    #[test]
    fn truncate_error_flattens_and_caps_length() {
        let long = "x".repeat(2000);
        let truncated = truncate_error(&long);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncated.chars().count(), 1027);
        assert_eq!(truncate_error("a\nb"), "a b");
    }
}
