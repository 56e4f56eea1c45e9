//! Statement domain model.
//!
//! # Responsibility
//! - Define the atomic fact record owned by the consistency engine.
//! - Provide lifecycle state parsing and ingestion validation.
//!
//! # Invariants
//! - `id` is a random UUID assigned once at creation and never reused.
//! - `text` is immutable after creation.
//! - Status moves `pending -> active` at most once; `deleted` is terminal.

use crate::similarity::Embedding;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Stable statement identifier.
pub type StatementId = Uuid;

/// Statement lifecycle state governing search visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementStatus {
    /// Stored but not yet verified against existing statements.
    Pending,
    /// Verified and visible to search.
    Active,
    /// Removed. Terminal.
    Deleted,
}

impl StatementStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// Persisted statement record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statement {
    pub id: StatementId,
    pub text: String,
    /// Where the statement came from (file path, URL, agent name).
    pub source: String,
    /// Free-form provenance category, e.g. `document` or `conversation`.
    pub source_type: String,
    pub status: StatementStatus,
    /// `None` until the embedding service has processed the text.
    #[serde(skip_serializing)]
    pub embedding: Option<Embedding>,
    pub created_at: i64,
    pub updated_at: i64,
    /// Set when the statement was last checked against its neighbours.
    pub last_verified_at: Option<i64>,
}

impl Statement {
    /// Returns whether the statement is search-visible.
    pub fn is_active(&self) -> bool {
        self.status == StatementStatus::Active
    }

    /// Returns the embedding only when it was produced by `model_id`.
    pub fn current_embedding(&self, model_id: &str) -> Option<&Embedding> {
        self.embedding
            .as_ref()
            .filter(|embedding| embedding.is_current(model_id))
    }
}

/// Ingestion request for one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewStatement {
    pub text: String,
    pub source: String,
    pub source_type: String,
}

impl NewStatement {
    pub fn new(
        text: impl Into<String>,
        source: impl Into<String>,
        source_type: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            source: source.into(),
            source_type: source_type.into(),
        }
    }

    /// Validates ingestion limits.
    ///
    /// # Errors
    /// - `Blank` when text is empty after trim.
    /// - `TooLarge` when the UTF-8 byte length exceeds `max_bytes`.
    pub fn validate(&self, max_bytes: usize) -> Result<(), StatementValidationError> {
        if self.text.trim().is_empty() {
            return Err(StatementValidationError::Blank);
        }
        if self.text.len() > max_bytes {
            return Err(StatementValidationError::TooLarge {
                len: self.text.len(),
                max: max_bytes,
            });
        }
        Ok(())
    }
}

/// Statement rejected at ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementValidationError {
    Blank,
    TooLarge { len: usize, max: usize },
}

impl Display for StatementValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blank => write!(f, "statement text must not be blank"),
            Self::TooLarge { len, max } => {
                write!(f, "statement text is {len} bytes, limit is {max}")
            }
        }
    }
}

impl Error for StatementValidationError {}

#[cfg(test)]
mod tests {
    use super::{NewStatement, StatementStatus, StatementValidationError};

    #[test]
    fn validate_rejects_blank_and_oversized_text() {
        assert_eq!(
            NewStatement::new("  ", "s", "t").validate(10),
            Err(StatementValidationError::Blank)
        );
        assert_eq!(
            NewStatement::new("0123456789x", "s", "t").validate(10),
            Err(StatementValidationError::TooLarge { len: 11, max: 10 })
        );
        assert!(NewStatement::new("0123456789", "s", "t").validate(10).is_ok());
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            StatementStatus::Pending,
            StatementStatus::Active,
            StatementStatus::Deleted,
        ] {
            assert_eq!(StatementStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(StatementStatus::parse("archived"), None);
    }
}
