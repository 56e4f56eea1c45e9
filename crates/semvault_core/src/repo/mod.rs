//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define use-case oriented data access contracts.
//! - Isolate SQLite query details from service/business orchestration.
//!
//! # Invariants
//! - Repositories borrow an already migrated connection (or transaction).
//! - Repository APIs return semantic errors (`*NotFound`) in addition to DB
//!   transport errors.
//! - Read paths reject invalid persisted state instead of masking it.

use crate::db::DbError;
use crate::model::issue::IssueId;
use crate::model::note::NoteId;
use crate::model::statement::StatementId;
use crate::model::task::TaskId;
use crate::similarity::{decode_embedding, Embedding};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub mod issue_repo;
pub mod note_repo;
pub mod statement_repo;
pub mod task_repo;
pub mod tree_repo;

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error for statement, issue, task and note persistence.
#[derive(Debug)]
pub enum RepoError {
    Db(DbError),
    StatementNotFound(StatementId),
    IssueNotFound(IssueId),
    TaskNotFound(TaskId),
    NoteNotFound(NoteId),
    InvalidData(String),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::StatementNotFound(id) => write!(f, "statement not found: {id}"),
            Self::IssueNotFound(id) => write!(f, "issue not found: {id}"),
            Self::TaskNotFound(id) => write!(f, "task not found: {id}"),
            Self::NoteNotFound(id) => write!(f, "note not found: {id}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

pub(crate) fn parse_uuid(value: &str, column: &'static str) -> Result<Uuid, String> {
    Uuid::parse_str(value).map_err(|_| format!("invalid uuid `{value}` in {column}"))
}

/// Rebuilds an embedding from its blob + model columns.
///
/// Both columns must be set or both `NULL`.
pub(crate) fn embedding_from_columns(
    blob: Option<Vec<u8>>,
    model_id: Option<String>,
    table: &'static str,
) -> Result<Option<Embedding>, String> {
    match (blob, model_id) {
        (None, None) => Ok(None),
        (Some(blob), Some(model_id)) => decode_embedding(&blob)
            .map(|values| Some(Embedding::new(values, model_id)))
            .map_err(|err| format!("{err} in {table}.embedding")),
        _ => Err(format!(
            "{table}.embedding and {table}.embedding_model must be set together"
        )),
    }
}

pub(crate) fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}
