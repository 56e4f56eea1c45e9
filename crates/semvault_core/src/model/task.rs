//! Background task domain model.
//!
//! # Invariants
//! - `attempts >= max_attempts` means the task is never claimed again.
//! - `completed` and `failed` are terminal.

use crate::model::note::NoteId;
use crate::model::statement::StatementId;
use crate::model::tree::TreeNodeId;
use serde::{Deserialize, Serialize};

/// Task row id.
pub type TaskId = i64;

/// Kind of background work. One worker loop runs per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Compute a missing or stale statement embedding.
    EmbedStatement,
    /// Insert a stored note into the category tree.
    ClassifyNote,
    /// Regenerate a tree node summary and its ancestors.
    RefreshSummary,
}

impl TaskType {
    pub const ALL: [TaskType; 3] = [
        TaskType::EmbedStatement,
        TaskType::ClassifyNote,
        TaskType::RefreshSummary,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmbedStatement => "embed_statement",
            Self::ClassifyNote => "classify_note",
            Self::RefreshSummary => "refresh_summary",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "embed_statement" => Some(Self::EmbedStatement),
            "classify_note" => Some(Self::ClassifyNote),
            "refresh_summary" => Some(Self::RefreshSummary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Persisted queue entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub priority: i64,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Task {
    /// Decodes the JSON payload into its typed form.
    pub fn decode_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedStatementPayload {
    pub statement_id: StatementId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifyNotePayload {
    pub note_id: NoteId,
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshSummaryPayload {
    pub node_id: TreeNodeId,
}

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}
