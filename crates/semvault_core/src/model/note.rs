//! Note domain model.
//!
//! Notes are user documents classified by the category tree. The tree only
//! stores references; the note row is the single copy of its content.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable note identifier.
pub type NoteId = Uuid;

/// Persisted note record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: NoteId,
    pub title: String,
    pub body: String,
    /// Normalized lowercase, deduplicated, sorted.
    pub tags: Vec<String>,
    /// One-sentence summary used for routing inside the tree.
    pub summary: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Create request for one note.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewNote {
    pub title: String,
    pub body: String,
    pub tags: Vec<String>,
    pub summary: String,
}
