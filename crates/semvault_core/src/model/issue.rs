//! Issue (nogood) domain model.
//!
//! # Responsibility
//! - Describe a recorded conflict between two statements.
//! - Define the resolution actions a reviewer can take.
//!
//! # Invariants
//! - The pair is stored in canonical order, so `(a, b)` and `(b, a)` are the
//!   same issue.
//! - At most one unresolved issue exists per pair.

use crate::model::statement::StatementId;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Issue row id.
pub type IssueId = i64;

/// Detected relation between the two statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Duplicate,
    Contradiction,
}

impl IssueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::Contradiction => "contradiction",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "duplicate" => Some(Self::Duplicate),
            "contradiction" => Some(Self::Contradiction),
            _ => None,
        }
    }
}

/// Review state. `Pending` and `Open` both count as unresolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    /// Recorded at ingestion without any model judgment.
    Pending,
    /// Confirmed by the promotion sweep or a model judgment.
    Open,
    Resolved,
}

impl IssueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Open => "open",
            Self::Resolved => "resolved",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "open" => Some(Self::Open),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }

    pub fn is_unresolved(self) -> bool {
        !matches!(self, Self::Resolved)
    }
}

/// Reviewer decision for one issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    KeepA,
    KeepB,
    KeepBoth,
    DeleteBoth,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KeepA => "keep_a",
            Self::KeepB => "keep_b",
            Self::KeepBoth => "keep_both",
            Self::DeleteBoth => "delete_both",
        }
    }

    /// Splits the pair into `(survivors, deleted)` for this decision.
    pub fn partition(
        self,
        a: StatementId,
        b: StatementId,
    ) -> (Vec<StatementId>, Vec<StatementId>) {
        match self {
            Self::KeepA => (vec![a], vec![b]),
            Self::KeepB => (vec![b], vec![a]),
            Self::KeepBoth => (vec![a, b], Vec::new()),
            Self::DeleteBoth => (Vec::new(), vec![a, b]),
        }
    }
}

/// Unknown resolution action text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseResolutionError(pub String);

impl Display for ParseResolutionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "unknown resolution `{}`; expected keep_a|keep_b|keep_both|delete_both",
            self.0
        )
    }
}

impl Error for ParseResolutionError {}

impl FromStr for Resolution {
    type Err = ParseResolutionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "keep_a" => Ok(Self::KeepA),
            "keep_b" => Ok(Self::KeepB),
            "keep_both" => Ok(Self::KeepBoth),
            "delete_both" => Ok(Self::DeleteBoth),
            _ => Err(ParseResolutionError(value.to_string())),
        }
    }
}

/// Persisted issue record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
    pub id: IssueId,
    pub statement_a: StatementId,
    pub statement_b: StatementId,
    pub kind: IssueKind,
    pub status: IssueStatus,
    pub score: Option<f64>,
    pub explanation: Option<String>,
    pub resolution: Option<Resolution>,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
}

impl Issue {
    pub fn involves(&self, statement_id: StatementId) -> bool {
        self.statement_a == statement_id || self.statement_b == statement_id
    }
}

/// Orders a pair the way it is stored.
pub fn canonical_pair(a: StatementId, b: StatementId) -> (StatementId, StatementId) {
    if a.to_string() <= b.to_string() {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::{canonical_pair, Resolution};
    use uuid::Uuid;

    #[test]
    fn resolution_parses_known_actions_only() {
        assert_eq!("keep_a".parse::<Resolution>(), Ok(Resolution::KeepA));
        assert_eq!(" Keep-Both ".parse::<Resolution>(), Ok(Resolution::KeepBoth));
        assert_eq!("delete_both".parse::<Resolution>(), Ok(Resolution::DeleteBoth));
        assert!("merge".parse::<Resolution>().is_err());
    }

    #[test]
    fn canonical_pair_is_order_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(canonical_pair(a, b), canonical_pair(b, a));
    }

    #[test]
    fn partition_keeps_and_deletes_expected_sides() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(Resolution::KeepA.partition(a, b), (vec![a], vec![b]));
        assert_eq!(Resolution::KeepB.partition(a, b), (vec![b], vec![a]));
        assert_eq!(Resolution::KeepBoth.partition(a, b).1, Vec::<Uuid>::new());
        assert_eq!(Resolution::DeleteBoth.partition(a, b).0, Vec::<Uuid>::new());
    }
}
