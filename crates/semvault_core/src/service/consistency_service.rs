//! Statement consistency use-cases.
//!
//! # Responsibility
//! - Ingest statements and compute or schedule their embeddings.
//! - Detect near-duplicate and contradictory pairs and record issues.
//! - Run the promotion sweep and the issue resolution workflow.
//!
//! # Invariants
//! - `pending -> active` happens at most once; `deleted` is terminal.
//! - Model failures never fail ingestion; the statement stays pending.
//! - At most one unresolved issue exists per unordered pair.
//! - The store lock is released before every model call.

use crate::config::{DuplicateStrategy, EngineConfig};
use crate::db::SharedDb;
use crate::model::issue::{Issue, IssueId, IssueKind, IssueStatus, ParseResolutionError, Resolution};
use crate::model::statement::{
    NewStatement, Statement, StatementId, StatementStatus, StatementValidationError,
};
use crate::model::task::{EmbedStatementPayload, TaskType};
use crate::provider::judgment::parse_yes_no;
use crate::provider::{embed_text, prompts, LanguageModel, ModelError};
use crate::queue::{TaskQueue, DEFAULT_PRIORITY};
use crate::repo::issue_repo::{IssueDraft, SqliteIssueRepository};
use crate::repo::statement_repo::{SqliteStatementRepository, StatementRepository};
use crate::repo::RepoError;
use crate::similarity::{cosine_similarity, Embedding};
use log::{info, warn};
use rusqlite::{Transaction, TransactionBehavior};
use serde::Serialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

const MAX_EXPLANATION_CHARS: usize = 500;

/// Service error for consistency use-cases.
#[derive(Debug)]
pub enum ConsistencyError {
    /// Statement text rejected at ingestion.
    Validation(StatementValidationError),
    /// Unknown resolution action text.
    InvalidResolution(ParseResolutionError),
    StatementNotFound(StatementId),
    IssueNotFound(IssueId),
    /// Issue exists but is already resolved.
    IssueNotOpen(IssueId),
    /// Model needed to answer the call synchronously is unavailable.
    ModelUnavailable(ModelError),
    /// Persistence-layer failure.
    Repo(RepoError),
}

impl Display for ConsistencyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::InvalidResolution(err) => write!(f, "{err}"),
            Self::StatementNotFound(id) => write!(f, "statement not found: {id}"),
            Self::IssueNotFound(id) => write!(f, "issue not found: {id}"),
            Self::IssueNotOpen(id) => write!(f, "issue {id} is already resolved"),
            Self::ModelUnavailable(err) => write!(f, "{err}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ConsistencyError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::InvalidResolution(err) => Some(err),
            Self::ModelUnavailable(err) => Some(err),
            Self::Repo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RepoError> for ConsistencyError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::StatementNotFound(id) => Self::StatementNotFound(id),
            RepoError::IssueNotFound(id) => Self::IssueNotFound(id),
            other => Self::Repo(other),
        }
    }
}

impl From<rusqlite::Error> for ConsistencyError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Repo(value.into())
    }
}

impl From<StatementValidationError> for ConsistencyError {
    fn from(value: StatementValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<ParseResolutionError> for ConsistencyError {
    fn from(value: ParseResolutionError) -> Self {
        Self::InvalidResolution(value)
    }
}

pub type ConsistencyResult<T> = Result<T, ConsistencyError>;

/// Result of one promotion sweep step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionOutcome {
    /// No pending statement exists.
    Idle,
    /// Every pending statement was visited; seen flags were cleared and the
    /// next step starts a new cycle.
    CycleRestarted,
    /// Statement had no conflicting neighbour and is now active.
    Promoted(StatementId),
    /// Statement conflicts with neighbours; issues were opened where missing.
    Flagged {
        statement_id: StatementId,
        opened: Vec<IssueId>,
    },
    /// Embedding could not be computed; retried next cycle.
    Deferred(StatementId),
}

impl PromotionOutcome {
    /// Whether the step touched a statement. A restarted cycle is not work,
    /// so a sweep loop waits one poll interval between cycles.
    pub fn did_work(&self) -> bool {
        !matches!(self, Self::Idle | Self::CycleRestarted)
    }
}

/// Effects of one issue resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionOutcome {
    pub issue_id: IssueId,
    pub resolution: Resolution,
    pub promoted: Vec<StatementId>,
    pub deleted: Vec<StatementId>,
    /// Other issues closed because they referenced a deleted statement.
    pub cascaded: Vec<IssueId>,
}

/// Statement with its similarity to a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredStatement {
    pub statement: Statement,
    pub score: f64,
}

/// Consistency engine over the shared store and model.
#[derive(Clone)]
pub struct ConsistencyService {
    db: SharedDb,
    model: Arc<dyn LanguageModel>,
    queue: TaskQueue,
    config: Arc<EngineConfig>,
}

impl ConsistencyService {
    pub fn new(
        db: SharedDb,
        model: Arc<dyn LanguageModel>,
        queue: TaskQueue,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            db,
            model,
            queue,
            config,
        }
    }

    /// Ingests one statement as pending.
    ///
    /// Computes the embedding inline and runs duplicate detection. When the
    /// model is unavailable an `embed_statement` task is queued instead and
    /// the call still succeeds.
    ///
    /// # Errors
    /// - `Validation` for blank or oversized text.
    /// - `Repo` when the insert fails.
    pub fn add_statement(
        &self,
        text: &str,
        source: &str,
        source_type: &str,
    ) -> ConsistencyResult<Statement> {
        let request = NewStatement::new(text, source, source_type);
        request.validate(self.config.max_statement_bytes)?;

        let statement = {
            let conn = self.db.lock();
            SqliteStatementRepository::new(&conn).insert_statement(&request)?
        };
        info!(
            "event=statement_add module=consistency status=ok statement_id={} bytes={}",
            statement.id,
            request.text.len()
        );

        match embed_text(self.model.as_ref(), &statement.text) {
            Ok(embedding) => {
                {
                    let conn = self.db.lock();
                    SqliteStatementRepository::new(&conn).set_embedding(statement.id, &embedding)?;
                }
                if let Err(err) = self.detect_conflicts(&statement, &embedding) {
                    warn!(
                        "event=conflict_detect module=consistency status=error statement_id={} error={err}",
                        statement.id
                    );
                }
            }
            Err(err) => {
                warn!(
                    "event=statement_embed module=consistency status=deferred statement_id={} error={err}",
                    statement.id
                );
                self.queue.enqueue(
                    TaskType::EmbedStatement,
                    &EmbedStatementPayload {
                        statement_id: statement.id,
                    },
                    DEFAULT_PRIORITY,
                );
            }
        }

        self.get_statement(statement.id)
    }

    pub fn get_statement(&self, id: StatementId) -> ConsistencyResult<Statement> {
        let conn = self.db.lock();
        SqliteStatementRepository::new(&conn)
            .get_statement(id)?
            .ok_or(ConsistencyError::StatementNotFound(id))
    }

    /// Runs the configured duplicate strategy for a freshly embedded
    /// statement. Returns the ids of issues it opened.
    fn detect_conflicts(
        &self,
        statement: &Statement,
        embedding: &Embedding,
    ) -> ConsistencyResult<Vec<IssueId>> {
        let neighbours = {
            let conn = self.db.lock();
            let candidates =
                SqliteStatementRepository::new(&conn).list_comparable(self.model.model_id())?;
            rank_neighbours(
                statement.id,
                embedding,
                candidates.into_iter().filter(Statement::is_active),
                self.config.duplicate_threshold,
                self.model.model_id(),
            )
        };

        let mut opened = Vec::new();
        match self.config.duplicate_strategy {
            DuplicateStrategy::MathOnly => {
                let conn = self.db.lock();
                let issues = SqliteIssueRepository::new(&conn);
                for (other, score) in &neighbours {
                    let draft = IssueDraft {
                        first: statement.id,
                        second: other.id,
                        kind: IssueKind::Duplicate,
                        status: IssueStatus::Pending,
                        score: Some(*score),
                        explanation: None,
                    };
                    if let Some(issue_id) = issues.insert_if_absent(&draft)? {
                        audit(&issues, issue_id, "opened", "duplicate");
                        opened.push(issue_id);
                    }
                }
            }
            DuplicateStrategy::Judgment => {
                for (other, score) in neighbours.iter().take(self.config.judgment_top_k) {
                    let Some(explanation) = self.judge_contradiction(statement, other) else {
                        continue;
                    };
                    let conn = self.db.lock();
                    let issues = SqliteIssueRepository::new(&conn);
                    let draft = IssueDraft {
                        first: statement.id,
                        second: other.id,
                        kind: IssueKind::Contradiction,
                        status: IssueStatus::Open,
                        score: Some(*score),
                        explanation: Some(explanation),
                    };
                    if let Some(issue_id) = issues.insert_if_absent(&draft)? {
                        audit(&issues, issue_id, "opened", "contradiction");
                        opened.push(issue_id);
                    }
                }
            }
        }

        if !opened.is_empty() {
            info!(
                "event=conflict_detect module=consistency status=ok statement_id={} opened={}",
                statement.id,
                opened.len()
            );
        }
        Ok(opened)
    }

    /// Asks the model whether two statements contradict.
    ///
    /// Returns the model's answer as explanation on "yes"; model errors and
    /// unparseable answers count as "no".
    fn judge_contradiction(&self, statement: &Statement, other: &Statement) -> Option<String> {
        let answer = match self
            .model
            .generate(&prompts::contradiction(&statement.text, &other.text))
        {
            Ok(answer) => answer,
            Err(err) => {
                warn!(
                    "event=contradiction_judge module=consistency status=error statement_id={} other_id={} error={err}",
                    statement.id, other.id
                );
                return None;
            }
        };
        if parse_yes_no(&answer).unwrap_or(false) {
            Some(answer.trim().chars().take(MAX_EXPLANATION_CHARS).collect())
        } else {
            None
        }
    }

    /// Runs one step of the promotion sweep.
    ///
    /// Visits the oldest pending statement not yet seen in this cycle. When
    /// every pending statement was seen, the flags are cleared and the step
    /// returns `CycleRestarted` without visiting anything.
    pub fn promote_next(&self) -> ConsistencyResult<PromotionOutcome> {
        let model_id = self.model.model_id().to_string();
        let statement = {
            let conn = self.db.lock();
            let repo = SqliteStatementRepository::new(&conn);
            match repo.next_unseen_pending()? {
                Some(statement) => statement,
                None if repo.clear_seen()? > 0 => return Ok(PromotionOutcome::CycleRestarted),
                None => return Ok(PromotionOutcome::Idle),
            }
        };

        let embedding = match statement.current_embedding(&model_id) {
            Some(embedding) => embedding.clone(),
            None => match embed_text(self.model.as_ref(), &statement.text) {
                Ok(embedding) => {
                    let conn = self.db.lock();
                    SqliteStatementRepository::new(&conn).set_embedding(statement.id, &embedding)?;
                    embedding
                }
                Err(err) => {
                    let conn = self.db.lock();
                    SqliteStatementRepository::new(&conn).mark_seen(statement.id)?;
                    warn!(
                        "event=statement_promote module=consistency status=deferred statement_id={} error={err}",
                        statement.id
                    );
                    return Ok(PromotionOutcome::Deferred(statement.id));
                }
            },
        };

        let conn = self.db.lock();
        let statements = SqliteStatementRepository::new(&conn);
        let offenders = rank_neighbours(
            statement.id,
            &embedding,
            statements.list_comparable(&model_id)?,
            self.config.duplicate_threshold,
            &model_id,
        );

        if offenders.is_empty() {
            statements.promote(statement.id)?;
            info!(
                "event=statement_promote module=consistency status=ok statement_id={}",
                statement.id
            );
            return Ok(PromotionOutcome::Promoted(statement.id));
        }

        let issues = SqliteIssueRepository::new(&conn);
        let mut opened = Vec::new();
        for (other, score) in &offenders {
            let draft = IssueDraft {
                first: statement.id,
                second: other.id,
                kind: IssueKind::Duplicate,
                status: IssueStatus::Open,
                score: Some(*score),
                explanation: None,
            };
            if let Some(issue_id) = issues.insert_if_absent(&draft)? {
                audit(&issues, issue_id, "opened", "promotion");
                opened.push(issue_id);
            }
        }
        statements.mark_seen(statement.id)?;
        info!(
            "event=statement_promote module=consistency status=flagged statement_id={} conflicts={} opened={}",
            statement.id,
            offenders.len(),
            opened.len()
        );
        Ok(PromotionOutcome::Flagged {
            statement_id: statement.id,
            opened,
        })
    }

    /// Resolves one unresolved issue in a single transaction.
    ///
    /// Deleted statements cascade: every other unresolved issue that
    /// references them is closed. Survivors are promoted.
    ///
    /// # Errors
    /// - `IssueNotFound` for unknown ids.
    /// - `IssueNotOpen` when the issue is already resolved.
    pub fn resolve_issue(
        &self,
        issue_id: IssueId,
        resolution: Resolution,
    ) -> ConsistencyResult<ResolutionOutcome> {
        let conn = self.db.lock();
        let tx = Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)?;
        let issues = SqliteIssueRepository::new(&tx);
        let statements = SqliteStatementRepository::new(&tx);

        let issue = issues
            .get_issue(issue_id)?
            .ok_or(ConsistencyError::IssueNotFound(issue_id))?;
        if !issue.status.is_unresolved() {
            return Err(ConsistencyError::IssueNotOpen(issue_id));
        }

        let (survivors, doomed) = resolution.partition(issue.statement_a, issue.statement_b);
        issues.resolve(issue_id, Some(resolution))?;

        let mut deleted = Vec::new();
        let mut cascaded = Vec::new();
        for statement_id in doomed {
            if statements.mark_deleted(statement_id)? {
                deleted.push(statement_id);
            }
            cascaded.extend(issues.close_for_statement(statement_id)?);
        }
        let mut promoted = Vec::new();
        for statement_id in survivors {
            if statements.promote(statement_id)? {
                promoted.push(statement_id);
            }
        }
        tx.commit()?;

        let issues = SqliteIssueRepository::new(&conn);
        audit(&issues, issue_id, "resolved", resolution.as_str());
        for closed in &cascaded {
            audit(&issues, *closed, "cascaded", &format!("via issue {issue_id}"));
        }
        info!(
            "event=issue_resolve module=consistency status=ok issue_id={issue_id} resolution={} promoted={} deleted={} cascaded={}",
            resolution.as_str(),
            promoted.len(),
            deleted.len(),
            cascaded.len()
        );

        Ok(ResolutionOutcome {
            issue_id,
            resolution,
            promoted,
            deleted,
            cascaded,
        })
    }

    /// Parses `action` and resolves the issue.
    pub fn resolve_issue_str(
        &self,
        issue_id: IssueId,
        action: &str,
    ) -> ConsistencyResult<ResolutionOutcome> {
        let resolution: Resolution = action.parse()?;
        self.resolve_issue(issue_id, resolution)
    }

    /// Pending and open issues, oldest first.
    pub fn list_open_issues(&self) -> ConsistencyResult<Vec<Issue>> {
        let conn = self.db.lock();
        Ok(SqliteIssueRepository::new(&conn).list_unresolved()?)
    }

    pub fn get_issue(&self, issue_id: IssueId) -> ConsistencyResult<Issue> {
        let conn = self.db.lock();
        SqliteIssueRepository::new(&conn)
            .get_issue(issue_id)?
            .ok_or(ConsistencyError::IssueNotFound(issue_id))
    }

    /// Deletes one statement and closes its unresolved issues.
    ///
    /// Returns the closed issue ids. Deleting an already deleted statement
    /// is a no-op.
    pub fn delete_statement(&self, id: StatementId) -> ConsistencyResult<Vec<IssueId>> {
        let conn = self.db.lock();
        let tx = Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)?;
        let statements = SqliteStatementRepository::new(&tx);
        if statements.get_statement(id)?.is_none() {
            return Err(ConsistencyError::StatementNotFound(id));
        }
        statements.mark_deleted(id)?;
        let cascaded = SqliteIssueRepository::new(&tx).close_for_statement(id)?;
        tx.commit()?;

        let issues = SqliteIssueRepository::new(&conn);
        for closed in &cascaded {
            audit(&issues, *closed, "cascaded", "statement deleted");
        }
        info!(
            "event=statement_delete module=consistency status=ok statement_id={id} cascaded={}",
            cascaded.len()
        );
        Ok(cascaded)
    }

    /// Flat similarity scan over active statements.
    ///
    /// Results are ordered by descending score; ties keep creation order.
    ///
    /// # Errors
    /// - `ModelUnavailable` when the query cannot be embedded.
    pub fn search_statements(
        &self,
        text: &str,
        limit: usize,
    ) -> ConsistencyResult<Vec<ScoredStatement>> {
        let query = embed_text(self.model.as_ref(), text).map_err(ConsistencyError::ModelUnavailable)?;
        let active = {
            let conn = self.db.lock();
            SqliteStatementRepository::new(&conn).list_by_status(StatementStatus::Active)?
        };

        let mut hits: Vec<ScoredStatement> = active
            .into_iter()
            .filter_map(|statement| {
                let score = cosine_similarity(
                    &query.values,
                    &statement.current_embedding(&query.model_id)?.values,
                );
                Some(ScoredStatement { statement, score })
            })
            .collect();
        hits.sort_by(|left, right| right.score.total_cmp(&left.score));
        hits.truncate(limit);
        Ok(hits)
    }

    /// Computes a missing or stale embedding. Task handler for
    /// `embed_statement`.
    ///
    /// Returns whether an embedding was written. Deleted and already current
    /// statements are skipped.
    pub fn embed_statement(&self, id: StatementId) -> ConsistencyResult<bool> {
        let statement = self.get_statement(id)?;
        if statement.status == StatementStatus::Deleted
            || statement.current_embedding(self.model.model_id()).is_some()
        {
            return Ok(false);
        }

        let embedding = embed_text(self.model.as_ref(), &statement.text)
            .map_err(ConsistencyError::ModelUnavailable)?;
        let conn = self.db.lock();
        match SqliteStatementRepository::new(&conn).set_embedding(id, &embedding) {
            Ok(()) => Ok(true),
            // Deleted while the model was running.
            Err(RepoError::StatementNotFound(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Queues `embed_statement` for every non-deleted statement whose
    /// embedding is missing or from another model. Returns the queued count.
    pub fn requeue_stale_embeddings(&self) -> ConsistencyResult<usize> {
        let stale = {
            let conn = self.db.lock();
            SqliteStatementRepository::new(&conn).list_needing_embedding(self.model.model_id())?
        };
        let queued = stale
            .into_iter()
            .filter_map(|statement_id| {
                self.queue.enqueue(
                    TaskType::EmbedStatement,
                    &EmbedStatementPayload { statement_id },
                    DEFAULT_PRIORITY,
                )
            })
            .count();
        info!("event=embedding_requeue module=consistency status=ok queued={queued}");
        Ok(queued)
    }
}

/// Statements other than `self_id` whose current embedding meets
/// `threshold`, most similar first.
fn rank_neighbours(
    self_id: StatementId,
    embedding: &Embedding,
    candidates: impl IntoIterator<Item = Statement>,
    threshold: f64,
    model_id: &str,
) -> Vec<(Statement, f64)> {
    let mut ranked: Vec<(Statement, f64)> = candidates
        .into_iter()
        .filter(|candidate| candidate.id != self_id)
        .filter_map(|candidate| {
            let score = cosine_similarity(
                &embedding.values,
                &candidate.current_embedding(model_id)?.values,
            );
            (score >= threshold).then_some((candidate, score))
        })
        .collect();
    ranked.sort_by(|left, right| right.1.total_cmp(&left.1));
    ranked
}

fn audit(issues: &SqliteIssueRepository<'_>, issue_id: IssueId, event: &str, detail: &str) {
    if let Err(err) = issues.record_event(issue_id, event, detail) {
        warn!(
            "event=issue_audit module=consistency status=error issue_id={issue_id} audit_event={event} error={err}"
        );
    }
}
