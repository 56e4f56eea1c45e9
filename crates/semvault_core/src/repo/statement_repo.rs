//! Statement repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Persist statements and their lifecycle transitions.
//! - Answer the candidate lookups the consistency engine compares against.
//!
//! # Invariants
//! - `promote` only moves `pending -> active`.
//! - `mark_deleted` is terminal and never resurrects a row.
//! - Embeddings are never written to deleted statements.
//! - Pending selection is deterministic: `created_at ASC, rowid ASC`.

use crate::model::statement::{NewStatement, Statement, StatementId, StatementStatus};
use crate::repo::{embedding_from_columns, parse_uuid, RepoError, RepoResult};
use crate::similarity::Embedding;
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

const STATEMENT_SELECT_SQL: &str = "SELECT
    statement_uuid,
    text,
    source,
    source_type,
    status,
    embedding,
    embedding_model,
    created_at,
    updated_at,
    last_verified_at
FROM statements";

/// Repository interface for statement persistence.
pub trait StatementRepository {
    /// Inserts one pending statement with a fresh random id.
    fn insert_statement(&self, statement: &NewStatement) -> RepoResult<Statement>;
    fn get_statement(&self, id: StatementId) -> RepoResult<Option<Statement>>;
    /// Stores an embedding for a non-deleted statement.
    fn set_embedding(&self, id: StatementId, embedding: &Embedding) -> RepoResult<()>;
    /// Moves a pending statement to active. Returns whether it changed.
    fn promote(&self, id: StatementId) -> RepoResult<bool>;
    /// Marks a statement deleted. Returns whether it changed.
    fn mark_deleted(&self, id: StatementId) -> RepoResult<bool>;
    /// Flags a pending statement as visited in the current promotion cycle.
    fn mark_seen(&self, id: StatementId) -> RepoResult<()>;
    /// Starts a new promotion cycle. Returns the number of flags cleared.
    fn clear_seen(&self) -> RepoResult<usize>;
    /// Oldest pending statement not yet visited in this cycle.
    fn next_unseen_pending(&self) -> RepoResult<Option<Statement>>;
    fn list_by_status(&self, status: StatementStatus) -> RepoResult<Vec<Statement>>;
    /// Non-deleted statements embedded by `model_id`, oldest first.
    fn list_comparable(&self, model_id: &str) -> RepoResult<Vec<Statement>>;
    /// Non-deleted statements with a missing or foreign-model embedding.
    fn list_needing_embedding(&self, model_id: &str) -> RepoResult<Vec<StatementId>>;
}

/// SQLite-backed statement repository.
pub struct SqliteStatementRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteStatementRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    fn query_statements(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> RepoResult<Vec<Statement>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(parse_statement_row(row)?);
        }
        Ok(items)
    }
}

impl StatementRepository for SqliteStatementRepository<'_> {
    fn insert_statement(&self, statement: &NewStatement) -> RepoResult<Statement> {
        let id = Uuid::new_v4();
        self.conn.execute(
            "INSERT INTO statements (
                statement_uuid,
                text,
                source,
                source_type,
                status
            ) VALUES (?1, ?2, ?3, ?4, 'pending');",
            params![
                id.to_string(),
                statement.text.as_str(),
                statement.source.as_str(),
                statement.source_type.as_str(),
            ],
        )?;
        self.get_statement(id)?
            .ok_or(RepoError::StatementNotFound(id))
    }

    fn get_statement(&self, id: StatementId) -> RepoResult<Option<Statement>> {
        let mut items = self.query_statements(
            &format!("{STATEMENT_SELECT_SQL} WHERE statement_uuid = ?1;"),
            [id.to_string()],
        )?;
        Ok(items.pop())
    }

    fn set_embedding(&self, id: StatementId, embedding: &Embedding) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE statements
             SET embedding = ?2,
                 embedding_model = ?3,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE statement_uuid = ?1
               AND status != 'deleted';",
            params![id.to_string(), embedding.to_blob(), embedding.model_id.as_str()],
        )?;
        if changed == 0 {
            return Err(RepoError::StatementNotFound(id));
        }
        Ok(())
    }

    fn promote(&self, id: StatementId) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "UPDATE statements
             SET status = 'active',
                 seen_in_cycle = 0,
                 last_verified_at = (strftime('%s', 'now') * 1000),
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE statement_uuid = ?1
               AND status = 'pending';",
            [id.to_string()],
        )?;
        Ok(changed == 1)
    }

    fn mark_deleted(&self, id: StatementId) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "UPDATE statements
             SET status = 'deleted',
                 seen_in_cycle = 0,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE statement_uuid = ?1
               AND status != 'deleted';",
            [id.to_string()],
        )?;
        Ok(changed == 1)
    }

    fn mark_seen(&self, id: StatementId) -> RepoResult<()> {
        self.conn.execute(
            "UPDATE statements
             SET seen_in_cycle = 1,
                 last_verified_at = (strftime('%s', 'now') * 1000)
             WHERE statement_uuid = ?1
               AND status = 'pending';",
            [id.to_string()],
        )?;
        Ok(())
    }

    fn clear_seen(&self) -> RepoResult<usize> {
        let changed = self.conn.execute(
            "UPDATE statements
             SET seen_in_cycle = 0
             WHERE seen_in_cycle = 1;",
            [],
        )?;
        Ok(changed)
    }

    fn next_unseen_pending(&self) -> RepoResult<Option<Statement>> {
        let mut items = self.query_statements(
            &format!(
                "{STATEMENT_SELECT_SQL}
                 WHERE status = 'pending'
                   AND seen_in_cycle = 0
                 ORDER BY created_at ASC, rowid ASC
                 LIMIT 1;"
            ),
            [],
        )?;
        Ok(items.pop())
    }

    fn list_by_status(&self, status: StatementStatus) -> RepoResult<Vec<Statement>> {
        self.query_statements(
            &format!(
                "{STATEMENT_SELECT_SQL}
                 WHERE status = ?1
                 ORDER BY created_at ASC, rowid ASC;"
            ),
            [status.as_str()],
        )
    }

    fn list_comparable(&self, model_id: &str) -> RepoResult<Vec<Statement>> {
        self.query_statements(
            &format!(
                "{STATEMENT_SELECT_SQL}
                 WHERE status != 'deleted'
                   AND embedding IS NOT NULL
                   AND embedding_model = ?1
                 ORDER BY created_at ASC, rowid ASC;"
            ),
            [model_id],
        )
    }

    fn list_needing_embedding(&self, model_id: &str) -> RepoResult<Vec<StatementId>> {
        let mut stmt = self.conn.prepare(
            "SELECT statement_uuid
             FROM statements
             WHERE status != 'deleted'
               AND (embedding IS NULL OR embedding_model IS NULL OR embedding_model != ?1)
             ORDER BY created_at ASC, rowid ASC;",
        )?;
        let mut rows = stmt.query([model_id])?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            let value: String = row.get(0)?;
            ids.push(
                parse_uuid(&value, "statements.statement_uuid").map_err(RepoError::InvalidData)?,
            );
        }
        Ok(ids)
    }
}

fn parse_statement_row(row: &Row<'_>) -> RepoResult<Statement> {
    let id_text: String = row.get("statement_uuid")?;
    let id = parse_uuid(&id_text, "statements.statement_uuid").map_err(RepoError::InvalidData)?;

    let status_text: String = row.get("status")?;
    let status = StatementStatus::parse(&status_text).ok_or_else(|| {
        RepoError::InvalidData(format!(
            "invalid statement status `{status_text}` in statements.status"
        ))
    })?;

    let embedding = embedding_from_columns(
        row.get("embedding")?,
        row.get("embedding_model")?,
        "statements",
    )
    .map_err(RepoError::InvalidData)?;

    Ok(Statement {
        id,
        text: row.get("text")?,
        source: row.get("source")?,
        source_type: row.get("source_type")?,
        status,
        embedding,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        last_verified_at: row.get("last_verified_at")?,
    })
}
