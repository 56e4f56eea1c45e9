//! Issue (nogood) persistence.
//!
//! # Invariants
//! - Pairs are written in canonical order.
//! - The partial unique index `idx_issues_unresolved_pair` guarantees at most
//!   one unresolved row per pair; `insert_if_absent` relies on it.
//! - Resolving only touches unresolved rows.

use crate::model::issue::{
    canonical_pair, Issue, IssueId, IssueKind, IssueStatus, Resolution,
};
use crate::model::statement::StatementId;
use crate::repo::{parse_uuid, RepoError, RepoResult};
use rusqlite::{params, Connection, Row};

const ISSUE_SELECT_SQL: &str = "SELECT
    issue_id,
    statement_a,
    statement_b,
    kind,
    status,
    score,
    explanation,
    resolution,
    created_at,
    resolved_at
FROM issues";

/// Detection result to record for one pair.
#[derive(Debug, Clone, PartialEq)]
pub struct IssueDraft {
    pub first: StatementId,
    pub second: StatementId,
    pub kind: IssueKind,
    pub status: IssueStatus,
    pub score: Option<f64>,
    pub explanation: Option<String>,
}

/// SQLite-backed issue repository.
pub struct SqliteIssueRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteIssueRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Inserts the issue unless an unresolved one already covers the pair.
    ///
    /// Returns the new id, or `None` when the pair already had one.
    pub fn insert_if_absent(&self, draft: &IssueDraft) -> RepoResult<Option<IssueId>> {
        let (a, b) = canonical_pair(draft.first, draft.second);
        if a == b {
            return Err(RepoError::InvalidData(format!(
                "issue pair must reference two statements, got {a} twice"
            )));
        }

        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO issues (
                statement_a,
                statement_b,
                kind,
                status,
                score,
                explanation
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
            params![
                a.to_string(),
                b.to_string(),
                draft.kind.as_str(),
                draft.status.as_str(),
                draft.score,
                draft.explanation.as_deref(),
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(self.conn.last_insert_rowid()))
    }

    pub fn get_issue(&self, id: IssueId) -> RepoResult<Option<Issue>> {
        let mut items = self.query_issues(
            &format!("{ISSUE_SELECT_SQL} WHERE issue_id = ?1;"),
            [id],
        )?;
        Ok(items.pop())
    }

    /// Pending and open issues, oldest first.
    pub fn list_unresolved(&self) -> RepoResult<Vec<Issue>> {
        self.query_issues(
            &format!(
                "{ISSUE_SELECT_SQL}
                 WHERE status != 'resolved'
                 ORDER BY created_at ASC, issue_id ASC;"
            ),
            [],
        )
    }

    pub fn list_unresolved_for(&self, statement_id: StatementId) -> RepoResult<Vec<Issue>> {
        self.query_issues(
            &format!(
                "{ISSUE_SELECT_SQL}
                 WHERE status != 'resolved'
                   AND (statement_a = ?1 OR statement_b = ?1)
                 ORDER BY created_at ASC, issue_id ASC;"
            ),
            [statement_id.to_string()],
        )
    }

    /// Closes one unresolved issue. Returns whether it changed.
    pub fn resolve(&self, id: IssueId, resolution: Option<Resolution>) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "UPDATE issues
             SET status = 'resolved',
                 resolution = ?2,
                 resolved_at = (strftime('%s', 'now') * 1000)
             WHERE issue_id = ?1
               AND status != 'resolved';",
            params![id, resolution.map(Resolution::as_str)],
        )?;
        Ok(changed == 1)
    }

    /// Closes every unresolved issue that references `statement_id`.
    ///
    /// Returns the ids that were closed.
    pub fn close_for_statement(&self, statement_id: StatementId) -> RepoResult<Vec<IssueId>> {
        let open = self.list_unresolved_for(statement_id)?;
        let mut closed = Vec::with_capacity(open.len());
        for issue in open {
            if self.resolve(issue.id, None)? {
                closed.push(issue.id);
            }
        }
        Ok(closed)
    }

    /// Appends one audit row.
    pub fn record_event(&self, issue_id: IssueId, event: &str, detail: &str) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO issue_events (issue_id, event, detail) VALUES (?1, ?2, ?3);",
            params![issue_id, event, detail],
        )?;
        Ok(())
    }

    pub fn count_events(&self, issue_id: IssueId) -> RepoResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM issue_events WHERE issue_id = ?1;",
            [issue_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn query_issues(&self, sql: &str, params: impl rusqlite::Params) -> RepoResult<Vec<Issue>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(parse_issue_row(row)?);
        }
        Ok(items)
    }
}

fn parse_issue_row(row: &Row<'_>) -> RepoResult<Issue> {
    let a_text: String = row.get("statement_a")?;
    let b_text: String = row.get("statement_b")?;
    let kind_text: String = row.get("kind")?;
    let status_text: String = row.get("status")?;
    let resolution_text: Option<String> = row.get("resolution")?;

    let kind = IssueKind::parse(&kind_text).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid issue kind `{kind_text}` in issues.kind"))
    })?;
    let status = IssueStatus::parse(&status_text).ok_or_else(|| {
        RepoError::InvalidData(format!(
            "invalid issue status `{status_text}` in issues.status"
        ))
    })?;
    let resolution = resolution_text
        .map(|value| {
            value.parse::<Resolution>().map_err(|_| {
                RepoError::InvalidData(format!(
                    "invalid resolution `{value}` in issues.resolution"
                ))
            })
        })
        .transpose()?;

    Ok(Issue {
        id: row.get("issue_id")?,
        statement_a: parse_uuid(&a_text, "issues.statement_a").map_err(RepoError::InvalidData)?,
        statement_b: parse_uuid(&b_text, "issues.statement_b").map_err(RepoError::InvalidData)?,
        kind,
        status,
        score: row.get("score")?,
        explanation: row.get("explanation")?,
        resolution,
        created_at: row.get("created_at")?,
        resolved_at: row.get("resolved_at")?,
    })
}
