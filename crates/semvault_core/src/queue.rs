//! Persisted priority task queue.
//!
//! # Responsibility
//! - Provide the claim/complete/fail/recover lifecycle over `tasks` rows.
//! - Keep enqueue failures out of caller control flow.
//!
//! # Invariants
//! - Execution is at-least-once; handlers must be idempotent.
//! - The store lock is held only for the duration of one repository call.

use crate::db::SharedDb;
use crate::model::task::{Task, TaskCounts, TaskId, TaskStatus, TaskType};
use crate::repo::task_repo::SqliteTaskRepository;
use crate::repo::{RepoError, RepoResult};
use log::{error, info, warn};
use serde::Serialize;

/// Default priority for background tasks.
pub const DEFAULT_PRIORITY: i64 = 0;

/// Cloneable queue handle over the shared store.
#[derive(Clone)]
pub struct TaskQueue {
    db: SharedDb,
    max_attempts: u32,
}

impl TaskQueue {
    pub fn new(db: SharedDb, max_attempts: u32) -> Self {
        Self { db, max_attempts }
    }

    /// Appends one pending task.
    ///
    /// Never fails visibly: a storage or encoding error is logged and `None`
    /// is returned.
    pub fn enqueue<P: Serialize>(
        &self,
        task_type: TaskType,
        payload: &P,
        priority: i64,
    ) -> Option<TaskId> {
        let payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(err) => {
                error!(
                    "event=task_enqueue module=queue status=error task_type={} error_code=payload_encode_failed error={err}",
                    task_type.as_str()
                );
                return None;
            }
        };

        let inserted = {
            let conn = self.db.lock();
            SqliteTaskRepository::new(&conn).insert(task_type, &payload, priority, self.max_attempts)
        };
        match inserted {
            Ok(task_id) => {
                info!(
                    "event=task_enqueue module=queue status=ok task_type={} task_id={task_id} priority={priority}",
                    task_type.as_str()
                );
                Some(task_id)
            }
            Err(err) => {
                error!(
                    "event=task_enqueue module=queue status=error task_type={} error_code=task_insert_failed error={err}",
                    task_type.as_str()
                );
                None
            }
        }
    }

    /// Claims the next runnable task of `task_type`, if any.
    pub fn dequeue(&self, task_type: TaskType) -> RepoResult<Option<Task>> {
        let conn = self.db.lock();
        SqliteTaskRepository::new(&conn).claim_next(task_type)
    }

    pub fn complete_task(&self, id: TaskId) -> RepoResult<()> {
        let conn = self.db.lock();
        SqliteTaskRepository::new(&conn).complete(id)
    }

    /// Records a failed attempt. Returns the status the task moved to.
    pub fn fail_task(&self, id: TaskId, error_text: &str) -> RepoResult<TaskStatus> {
        let status = {
            let conn = self.db.lock();
            SqliteTaskRepository::new(&conn).fail(id, error_text)?
        };
        if status == TaskStatus::Failed {
            warn!("event=task_fail module=queue status=exhausted task_id={id}");
        }
        Ok(status)
    }

    /// Returns every task stuck in `processing` to `pending`.
    ///
    /// Run once before workers start.
    pub fn recover_stale_tasks(&self) -> RepoResult<usize> {
        let recovered = {
            let conn = self.db.lock();
            SqliteTaskRepository::new(&conn).recover_processing()?
        };
        info!("event=task_recover module=queue status=ok recovered={recovered}");
        Ok(recovered)
    }

    pub fn counts(&self) -> RepoResult<TaskCounts> {
        let conn = self.db.lock();
        SqliteTaskRepository::new(&conn).counts()
    }

    pub fn get_task(&self, id: TaskId) -> RepoResult<Task> {
        let conn = self.db.lock();
        SqliteTaskRepository::new(&conn)
            .get(id)?
            .ok_or(RepoError::TaskNotFound(id))
    }

    /// Deletes completed tasks last updated at least `older_than_ms` ago.
    pub fn purge_completed(&self, older_than_ms: i64) -> RepoResult<usize> {
        let conn = self.db.lock();
        let now_ms: i64 =
            conn.query_row("SELECT (strftime('%s', 'now') * 1000);", [], |row| row.get(0))?;
        SqliteTaskRepository::new(&conn).purge_completed(now_ms.saturating_sub(older_than_ms))
    }
}
