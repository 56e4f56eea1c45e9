//! Category tree domain model.
//!
//! # Invariants
//! - A node has at most one parent; nodes without a parent are roots.
//! - Only leaves own note memberships.
//! - Root labels are unique.

use crate::similarity::Embedding;
use serde::Serialize;
use uuid::Uuid;

/// Stable tree node identifier.
pub type TreeNodeId = Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeNode {
    pub id: TreeNodeId,
    pub label: String,
    /// Generated from member notes (leaf) or direct children (internal).
    pub summary: String,
    pub is_leaf: bool,
    pub parent_id: Option<TreeNodeId>,
    /// Summary embedding used to gate query descent.
    #[serde(skip_serializing)]
    pub embedding: Option<Embedding>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TreeNode {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Returns the embedding only when it was produced by `model_id`.
    pub fn current_embedding(&self, model_id: &str) -> Option<&Embedding> {
        self.embedding
            .as_ref()
            .filter(|embedding| embedding.is_current(model_id))
    }
}
