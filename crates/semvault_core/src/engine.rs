//! Engine facade.
//!
//! # Responsibility
//! - Own the shared store handle, the model, configuration and services.
//! - Expose the synchronous public API.
//! - Start and stop the background worker pool.
//!
//! # Invariants
//! - Stale `processing` tasks are recovered before any worker starts.
//! - At most one worker pool runs per engine.

use crate::config::{ConfigError, EngineConfig};
use crate::db::{DbError, SharedDb};
use crate::model::issue::{Issue, IssueId, Resolution};
use crate::model::note::{NewNote, Note, NoteId};
use crate::model::statement::{Statement, StatementId};
use crate::model::task::{
    ClassifyNotePayload, EmbedStatementPayload, RefreshSummaryPayload, Task, TaskCounts, TaskId,
    TaskType,
};
use crate::model::tree::{TreeNode, TreeNodeId};
use crate::provider::LanguageModel;
use crate::queue::{TaskQueue, DEFAULT_PRIORITY};
use crate::repo::RepoError;
use crate::service::consistency_service::{
    ConsistencyError, ConsistencyService, PromotionOutcome, ResolutionOutcome, ScoredStatement,
};
use crate::service::note_service::{NoteService, NoteServiceError};
use crate::service::tree_service::{InsertReport, TreeService, TreeServiceError};
use crate::worker::{HandlerError, ShutdownReport, StopSignal, WorkerError, WorkerPool};
use log::{info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

/// Top-level error returned by `Engine` calls.
#[derive(Debug)]
pub enum EngineError {
    Db(DbError),
    Config(ConfigError),
    Consistency(ConsistencyError),
    Tree(TreeServiceError),
    Note(NoteServiceError),
    Queue(RepoError),
    Worker(WorkerError),
    /// `start_workers` was called while a pool is running.
    WorkersAlreadyRunning,
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::Config(err) => write!(f, "{err}"),
            Self::Consistency(err) => write!(f, "{err}"),
            Self::Tree(err) => write!(f, "{err}"),
            Self::Note(err) => write!(f, "{err}"),
            Self::Queue(err) => write!(f, "{err}"),
            Self::Worker(err) => write!(f, "{err}"),
            Self::WorkersAlreadyRunning => write!(f, "workers are already running"),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Config(err) => Some(err),
            Self::Consistency(err) => Some(err),
            Self::Tree(err) => Some(err),
            Self::Note(err) => Some(err),
            Self::Queue(err) => Some(err),
            Self::Worker(err) => Some(err),
            Self::WorkersAlreadyRunning => None,
        }
    }
}

impl From<DbError> for EngineError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<ConfigError> for EngineError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<ConsistencyError> for EngineError {
    fn from(value: ConsistencyError) -> Self {
        Self::Consistency(value)
    }
}

impl From<TreeServiceError> for EngineError {
    fn from(value: TreeServiceError) -> Self {
        Self::Tree(value)
    }
}

impl From<NoteServiceError> for EngineError {
    fn from(value: NoteServiceError) -> Self {
        Self::Note(value)
    }
}

impl From<RepoError> for EngineError {
    fn from(value: RepoError) -> Self {
        Self::Queue(value)
    }
}

impl From<WorkerError> for EngineError {
    fn from(value: WorkerError) -> Self {
        Self::Worker(value)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Embedded semantic store: consistency layer plus category tree.
pub struct Engine {
    db: SharedDb,
    config: Arc<EngineConfig>,
    queue: TaskQueue,
    consistency: ConsistencyService,
    notes: NoteService,
    tree: TreeService,
    workers: Mutex<Option<WorkerPool>>,
}

impl Engine {
    /// Opens (and migrates) a database file.
    pub fn open(
        path: impl AsRef<Path>,
        model: Arc<dyn LanguageModel>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        config.validate()?;
        Self::with_db(SharedDb::open(path)?, model, config)
    }

    /// Opens a private in-memory store.
    pub fn open_in_memory(
        model: Arc<dyn LanguageModel>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        config.validate()?;
        Self::with_db(SharedDb::open_in_memory()?, model, config)
    }

    /// Builds an engine over an already migrated store.
    pub fn with_db(
        db: SharedDb,
        model: Arc<dyn LanguageModel>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let queue = TaskQueue::new(db.clone(), config.task_max_attempts);
        let consistency =
            ConsistencyService::new(db.clone(), Arc::clone(&model), queue.clone(), Arc::clone(&config));
        let tree = TreeService::new(db.clone(), Arc::clone(&model), queue.clone(), Arc::clone(&config));
        info!(
            "event=engine_open module=engine status=ok model_id={} strategy={:?}",
            model.model_id(),
            config.duplicate_strategy
        );
        Ok(Self {
            notes: NoteService::new(db.clone()),
            db,
            config,
            queue,
            consistency,
            tree,
            workers: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared store handle, for embedding callers that need raw reads.
    pub fn db(&self) -> &SharedDb {
        &self.db
    }

    pub fn add_statement(
        &self,
        text: &str,
        source: &str,
        source_type: &str,
    ) -> EngineResult<Statement> {
        Ok(self.consistency.add_statement(text, source, source_type)?)
    }

    pub fn get_statement(&self, id: StatementId) -> EngineResult<Statement> {
        Ok(self.consistency.get_statement(id)?)
    }

    pub fn delete_statement(&self, id: StatementId) -> EngineResult<Vec<IssueId>> {
        Ok(self.consistency.delete_statement(id)?)
    }

    pub fn search_statements(&self, text: &str, limit: usize) -> EngineResult<Vec<ScoredStatement>> {
        Ok(self.consistency.search_statements(text, limit)?)
    }

    /// Runs one promotion sweep step in the caller's thread.
    pub fn promote_next(&self) -> EngineResult<PromotionOutcome> {
        Ok(self.consistency.promote_next()?)
    }

    pub fn resolve_issue(
        &self,
        issue_id: IssueId,
        resolution: Resolution,
    ) -> EngineResult<ResolutionOutcome> {
        Ok(self.consistency.resolve_issue(issue_id, resolution)?)
    }

    /// Parses `action` (`keep_a`, `keep_b`, `keep_both`, `delete_both`) and
    /// resolves the issue.
    pub fn resolve_issue_str(&self, issue_id: IssueId, action: &str) -> EngineResult<ResolutionOutcome> {
        Ok(self.consistency.resolve_issue_str(issue_id, action)?)
    }

    pub fn list_open_issues(&self) -> EngineResult<Vec<Issue>> {
        Ok(self.consistency.list_open_issues()?)
    }

    pub fn get_issue(&self, issue_id: IssueId) -> EngineResult<Issue> {
        Ok(self.consistency.get_issue(issue_id)?)
    }

    pub fn requeue_stale_embeddings(&self) -> EngineResult<usize> {
        Ok(self.consistency.requeue_stale_embeddings()?)
    }

    pub fn create_note(&self, note: &NewNote) -> EngineResult<Note> {
        Ok(self.notes.create_note(note)?)
    }

    pub fn get_note(&self, id: NoteId) -> EngineResult<Note> {
        Ok(self.notes.get_note(id)?)
    }

    /// Files a stored note into the tree synchronously.
    pub fn insert_note(&self, note_id: NoteId, tag: &str, summary: &str) -> EngineResult<InsertReport> {
        Ok(self.tree.insert_note(note_id, tag, summary)?)
    }

    /// Stores a note and queues its classification under `tag`.
    ///
    /// Returns the stored note and the queued task id. A failed enqueue is
    /// logged and yields `None`; the note is still stored.
    pub fn submit_note(&self, note: &NewNote, tag: &str) -> EngineResult<(Note, Option<TaskId>)> {
        if crate::repo::note_repo::normalize_tag(tag).is_none() {
            return Err(TreeServiceError::InvalidTag(tag.to_string()).into());
        }
        let stored = self.notes.create_note(note)?;
        let task_id = self.queue.enqueue(
            TaskType::ClassifyNote,
            &ClassifyNotePayload {
                note_id: stored.id,
                tag: tag.to_string(),
            },
            DEFAULT_PRIORITY,
        );
        Ok((stored, task_id))
    }

    pub fn remove_note(&self, note_id: NoteId) -> EngineResult<usize> {
        Ok(self.tree.remove_note(note_id)?)
    }

    pub fn refresh_summary(&self, node_id: TreeNodeId) -> EngineResult<()> {
        Ok(self.tree.refresh_summary(node_id)?)
    }

    pub fn query(&self, text: &str) -> EngineResult<Vec<Note>> {
        Ok(self.tree.query(text)?)
    }

    pub fn query_json(&self, text: &str) -> EngineResult<String> {
        Ok(self.tree.query_json(text)?)
    }

    pub fn list_roots(&self) -> EngineResult<Vec<TreeNode>> {
        Ok(self.tree.list_roots()?)
    }

    pub fn list_children(&self, node_id: TreeNodeId) -> EngineResult<Vec<TreeNode>> {
        Ok(self.tree.list_children(node_id)?)
    }

    pub fn list_members(&self, node_id: TreeNodeId) -> EngineResult<Vec<NoteId>> {
        Ok(self.tree.list_members(node_id)?)
    }

    pub fn task_counts(&self) -> EngineResult<TaskCounts> {
        Ok(self.queue.counts()?)
    }

    pub fn get_task(&self, id: TaskId) -> EngineResult<Task> {
        Ok(self.queue.get_task(id)?)
    }

    /// Starts one worker per task type plus the promotion and purge sweeps.
    ///
    /// Tasks left in `processing` by a previous run are returned to
    /// `pending` first.
    pub fn start_workers(&self) -> EngineResult<()> {
        self.start_workers_with(StopSignal::new())
    }

    /// Same as `start_workers`, driven by a caller-owned stop signal.
    pub fn start_workers_with(&self, stop: StopSignal) -> EngineResult<()> {
        let mut slot = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(EngineError::WorkersAlreadyRunning);
        }

        self.queue.recover_stale_tasks()?;
        let mut pool = WorkerPool::new(self.queue.clone(), stop, self.config.poll_interval());

        let consistency = self.consistency.clone();
        pool.spawn_queue_worker(
            TaskType::EmbedStatement,
            Arc::new(move |task: &Task| -> Result<(), HandlerError> {
                let payload: EmbedStatementPayload = task.decode_payload()?;
                match consistency.embed_statement(payload.statement_id) {
                    Ok(_) | Err(ConsistencyError::StatementNotFound(_)) => Ok(()),
                    Err(err) => Err(HandlerError::failed(err)),
                }
            }),
        )?;

        let tree = self.tree.clone();
        pool.spawn_queue_worker(
            TaskType::ClassifyNote,
            Arc::new(move |task: &Task| -> Result<(), HandlerError> {
                let payload: ClassifyNotePayload = task.decode_payload()?;
                tree.insert_note(payload.note_id, &payload.tag, "")
                    .map(|_| ())
                    .map_err(HandlerError::failed)
            }),
        )?;

        let tree = self.tree.clone();
        pool.spawn_queue_worker(
            TaskType::RefreshSummary,
            Arc::new(move |task: &Task| -> Result<(), HandlerError> {
                let payload: RefreshSummaryPayload = task.decode_payload()?;
                tree.refresh_summary(payload.node_id)
                    .map_err(HandlerError::failed)
            }),
        )?;

        let consistency = self.consistency.clone();
        pool.spawn_sweeper("promotion", move || -> Result<bool, HandlerError> {
            consistency
                .promote_next()
                .map(|outcome| outcome.did_work())
                .map_err(HandlerError::failed)
        })?;

        let queue = self.queue.clone();
        let retention_ms = self.config.completed_task_retention_ms;
        pool.spawn_sweeper("purge", move || -> Result<bool, HandlerError> {
            queue
                .purge_completed(retention_ms)
                .map(|purged| purged > 0)
                .map_err(HandlerError::failed)
        })?;

        info!(
            "event=workers_start module=engine status=ok loops={}",
            pool.loop_names().join(",")
        );
        *slot = Some(pool);
        Ok(())
    }

    /// Stops the worker pool within the configured grace period.
    ///
    /// Returns an empty report when no pool is running.
    pub fn shutdown(&self) -> ShutdownReport {
        let pool = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match pool {
            Some(mut pool) => pool.shutdown(self.config.shutdown_grace()),
            None => {
                warn!("event=workers_stop module=engine status=skipped reason=not_running");
                ShutdownReport::default()
            }
        }
    }
}
