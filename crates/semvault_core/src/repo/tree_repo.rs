//! Category tree repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Persist tree nodes, parent links, summaries and leaf memberships.
//! - Keep SQL details and ordering behavior inside repository boundary.
//!
//! # Invariants
//! - Child and root listing is deterministic: `created_at ASC, rowid ASC`.
//! - Membership listing is deterministic: `added_at ASC, rowid ASC`.
//! - Root labels are unique; `find_or_create_root` never creates a second
//!   root for the same label.
//! - A summary update always replaces the embedding; `None` clears it.

use crate::db::DbError;
use crate::model::note::NoteId;
use crate::model::tree::{TreeNode, TreeNodeId};
use crate::repo::{bool_to_int, embedding_from_columns};
use crate::similarity::Embedding;
use rusqlite::{params, Connection, Row};
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

const NODE_SELECT_SQL: &str = "SELECT
    node_uuid,
    label,
    summary,
    is_leaf,
    parent_uuid,
    embedding,
    embedding_model,
    created_at,
    updated_at
FROM tree_nodes";

/// Result type used by tree repository operations.
pub type TreeRepoResult<T> = Result<T, TreeRepoError>;

/// Errors from tree repository operations.
#[derive(Debug)]
pub enum TreeRepoError {
    /// Underlying SQLite/bootstrap error.
    Db(DbError),
    /// Target node does not exist.
    NodeNotFound(TreeNodeId),
    /// Parent links loop back onto a visited node.
    CycleDetected(TreeNodeId),
    /// Persisted data cannot be converted to valid read model.
    InvalidData(String),
}

impl Display for TreeRepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::NodeNotFound(id) => write!(f, "tree node not found: {id}"),
            Self::CycleDetected(id) => write!(f, "tree parent chain loops at node {id}"),
            Self::InvalidData(message) => write!(f, "invalid tree data: {message}"),
        }
    }
}

impl Error for TreeRepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::NodeNotFound(_) => None,
            Self::CycleDetected(_) => None,
            Self::InvalidData(_) => None,
        }
    }
}

impl From<DbError> for TreeRepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for TreeRepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Repository interface for category tree operations.
pub trait TreeRepository {
    /// Returns the root labeled `label`, creating an empty leaf root if absent.
    fn find_or_create_root(&self, label: &str) -> TreeRepoResult<TreeNode>;
    /// Creates one child node under `parent_id`.
    fn create_node(
        &self,
        parent_id: TreeNodeId,
        label: &str,
        is_leaf: bool,
    ) -> TreeRepoResult<TreeNode>;
    fn get_node(&self, id: TreeNodeId) -> TreeRepoResult<Option<TreeNode>>;
    fn list_roots(&self) -> TreeRepoResult<Vec<TreeNode>>;
    fn list_children(&self, parent_id: TreeNodeId) -> TreeRepoResult<Vec<TreeNode>>;
    fn count_children(&self, parent_id: TreeNodeId) -> TreeRepoResult<usize>;
    /// Adds one note to a leaf. Returns `false` when already a member.
    fn add_member(&self, node_id: TreeNodeId, note_id: NoteId) -> TreeRepoResult<bool>;
    fn list_members(&self, node_id: TreeNodeId) -> TreeRepoResult<Vec<NoteId>>;
    fn count_members(&self, node_id: TreeNodeId) -> TreeRepoResult<usize>;
    /// Leaves holding `note_id`, oldest first.
    fn leaves_containing(&self, note_id: NoteId) -> TreeRepoResult<Vec<TreeNodeId>>;
    fn remove_member(&self, node_id: TreeNodeId, note_id: NoteId) -> TreeRepoResult<bool>;
    /// Drops every direct membership of a node. Returns the removed count.
    fn clear_members(&self, node_id: TreeNodeId) -> TreeRepoResult<usize>;
    /// Replaces summary text and summary embedding together.
    fn update_summary(
        &self,
        id: TreeNodeId,
        summary: &str,
        embedding: Option<&Embedding>,
    ) -> TreeRepoResult<()>;
    fn set_leaf(&self, id: TreeNodeId, is_leaf: bool) -> TreeRepoResult<()>;
    /// Moves one node under `new_parent_id`.
    fn reparent(&self, id: TreeNodeId, new_parent_id: TreeNodeId) -> TreeRepoResult<()>;
    /// Deletes one node; its memberships cascade.
    fn delete_node(&self, id: TreeNodeId) -> TreeRepoResult<()>;
    /// Ancestors of `id`, nearest parent first, ending at the root.
    fn ancestors(&self, id: TreeNodeId) -> TreeRepoResult<Vec<TreeNode>>;
}

/// SQLite-backed category tree repository.
pub struct SqliteTreeRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteTreeRepository<'conn> {
    /// `conn` must come from `open_db`/`open_db_in_memory`, which leave the
    /// tree tables in place.
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    fn query_nodes(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> TreeRepoResult<Vec<TreeNode>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(parse_tree_node_row(row)?);
        }
        Ok(items)
    }

    fn expect_changed(&self, changed: usize, id: TreeNodeId) -> TreeRepoResult<()> {
        if changed == 0 {
            return Err(TreeRepoError::NodeNotFound(id));
        }
        Ok(())
    }
}

impl TreeRepository for SqliteTreeRepository<'_> {
    fn find_or_create_root(&self, label: &str) -> TreeRepoResult<TreeNode> {
        self.conn.execute(
            "INSERT OR IGNORE INTO tree_nodes (node_uuid, label, is_leaf, parent_uuid)
             VALUES (?1, ?2, 1, NULL);",
            params![Uuid::new_v4().to_string(), label],
        )?;
        let mut roots = self.query_nodes(
            &format!("{NODE_SELECT_SQL} WHERE parent_uuid IS NULL AND label = ?1;"),
            [label],
        )?;
        roots
            .pop()
            .ok_or_else(|| TreeRepoError::InvalidData(format!("root `{label}` vanished")))
    }

    fn create_node(
        &self,
        parent_id: TreeNodeId,
        label: &str,
        is_leaf: bool,
    ) -> TreeRepoResult<TreeNode> {
        if self.get_node(parent_id)?.is_none() {
            return Err(TreeRepoError::NodeNotFound(parent_id));
        }
        let id = Uuid::new_v4();
        self.conn.execute(
            "INSERT INTO tree_nodes (node_uuid, label, is_leaf, parent_uuid)
             VALUES (?1, ?2, ?3, ?4);",
            params![
                id.to_string(),
                label,
                bool_to_int(is_leaf),
                parent_id.to_string()
            ],
        )?;
        self.get_node(id)?.ok_or(TreeRepoError::NodeNotFound(id))
    }

    fn get_node(&self, id: TreeNodeId) -> TreeRepoResult<Option<TreeNode>> {
        let mut items = self.query_nodes(
            &format!("{NODE_SELECT_SQL} WHERE node_uuid = ?1;"),
            [id.to_string()],
        )?;
        Ok(items.pop())
    }

    fn list_roots(&self) -> TreeRepoResult<Vec<TreeNode>> {
        self.query_nodes(
            &format!(
                "{NODE_SELECT_SQL} WHERE parent_uuid IS NULL ORDER BY created_at ASC, rowid ASC;"
            ),
            [],
        )
    }

    fn list_children(&self, parent_id: TreeNodeId) -> TreeRepoResult<Vec<TreeNode>> {
        self.query_nodes(
            &format!(
                "{NODE_SELECT_SQL} WHERE parent_uuid = ?1 ORDER BY created_at ASC, rowid ASC;"
            ),
            [parent_id.to_string()],
        )
    }

    fn count_children(&self, parent_id: TreeNodeId) -> TreeRepoResult<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM tree_nodes WHERE parent_uuid = ?1;",
            [parent_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    fn add_member(&self, node_id: TreeNodeId, note_id: NoteId) -> TreeRepoResult<bool> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO tree_members (node_uuid, note_uuid) VALUES (?1, ?2);",
            params![node_id.to_string(), note_id.to_string()],
        )?;
        Ok(changed > 0)
    }

    fn list_members(&self, node_id: TreeNodeId) -> TreeRepoResult<Vec<NoteId>> {
        let mut stmt = self.conn.prepare(
            "SELECT note_uuid
             FROM tree_members
             WHERE node_uuid = ?1
             ORDER BY added_at ASC, rowid ASC;",
        )?;
        let mut rows = stmt.query([node_id.to_string()])?;
        let mut members = Vec::new();
        while let Some(row) = rows.next()? {
            let value: String = row.get(0)?;
            members.push(parse_uuid(&value, "tree_members.note_uuid")?);
        }
        Ok(members)
    }

    fn count_members(&self, node_id: TreeNodeId) -> TreeRepoResult<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM tree_members WHERE node_uuid = ?1;",
            [node_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    fn leaves_containing(&self, note_id: NoteId) -> TreeRepoResult<Vec<TreeNodeId>> {
        let mut stmt = self.conn.prepare(
            "SELECT node_uuid
             FROM tree_members
             WHERE note_uuid = ?1
             ORDER BY added_at ASC, rowid ASC;",
        )?;
        let mut rows = stmt.query([note_id.to_string()])?;
        let mut leaves = Vec::new();
        while let Some(row) = rows.next()? {
            let value: String = row.get(0)?;
            leaves.push(parse_uuid(&value, "tree_members.node_uuid")?);
        }
        Ok(leaves)
    }

    fn remove_member(&self, node_id: TreeNodeId, note_id: NoteId) -> TreeRepoResult<bool> {
        let changed = self.conn.execute(
            "DELETE FROM tree_members WHERE node_uuid = ?1 AND note_uuid = ?2;",
            params![node_id.to_string(), note_id.to_string()],
        )?;
        Ok(changed > 0)
    }

    fn clear_members(&self, node_id: TreeNodeId) -> TreeRepoResult<usize> {
        Ok(self.conn.execute(
            "DELETE FROM tree_members WHERE node_uuid = ?1;",
            [node_id.to_string()],
        )?)
    }

    fn update_summary(
        &self,
        id: TreeNodeId,
        summary: &str,
        embedding: Option<&Embedding>,
    ) -> TreeRepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE tree_nodes
             SET summary = ?2,
                 embedding = ?3,
                 embedding_model = ?4,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE node_uuid = ?1;",
            params![
                id.to_string(),
                summary,
                embedding.map(Embedding::to_blob),
                embedding.map(|value| value.model_id.as_str()),
            ],
        )?;
        self.expect_changed(changed, id)
    }

    fn set_leaf(&self, id: TreeNodeId, is_leaf: bool) -> TreeRepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE tree_nodes
             SET is_leaf = ?2,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE node_uuid = ?1;",
            params![id.to_string(), bool_to_int(is_leaf)],
        )?;
        self.expect_changed(changed, id)
    }

    fn reparent(&self, id: TreeNodeId, new_parent_id: TreeNodeId) -> TreeRepoResult<()> {
        if id == new_parent_id {
            return Err(TreeRepoError::CycleDetected(id));
        }
        let changed = self.conn.execute(
            "UPDATE tree_nodes
             SET parent_uuid = ?2,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE node_uuid = ?1;",
            params![id.to_string(), new_parent_id.to_string()],
        )?;
        self.expect_changed(changed, id)
    }

    fn delete_node(&self, id: TreeNodeId) -> TreeRepoResult<()> {
        let changed = self
            .conn
            .execute("DELETE FROM tree_nodes WHERE node_uuid = ?1;", [id.to_string()])?;
        self.expect_changed(changed, id)
    }

    fn ancestors(&self, id: TreeNodeId) -> TreeRepoResult<Vec<TreeNode>> {
        let start = self
            .get_node(id)?
            .ok_or(TreeRepoError::NodeNotFound(id))?;

        let mut visited = HashSet::from([start.id]);
        let mut chain = Vec::new();
        let mut next = start.parent_id;
        while let Some(parent_id) = next {
            if !visited.insert(parent_id) {
                return Err(TreeRepoError::CycleDetected(parent_id));
            }
            let parent = self
                .get_node(parent_id)?
                .ok_or(TreeRepoError::NodeNotFound(parent_id))?;
            next = parent.parent_id;
            chain.push(parent);
        }
        Ok(chain)
    }
}

fn parse_tree_node_row(row: &Row<'_>) -> TreeRepoResult<TreeNode> {
    let id_text: String = row.get("node_uuid")?;
    let parent_text: Option<String> = row.get("parent_uuid")?;
    let is_leaf: i64 = row.get("is_leaf")?;
    let embedding = embedding_from_columns(
        row.get("embedding")?,
        row.get("embedding_model")?,
        "tree_nodes",
    )
    .map_err(TreeRepoError::InvalidData)?;

    Ok(TreeNode {
        id: parse_uuid(&id_text, "tree_nodes.node_uuid")?,
        label: row.get("label")?,
        summary: row.get("summary")?,
        is_leaf: is_leaf != 0,
        parent_id: parent_text
            .as_deref()
            .map(|value| parse_uuid(value, "tree_nodes.parent_uuid"))
            .transpose()?,
        embedding,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn parse_uuid(value: &str, column: &'static str) -> TreeRepoResult<Uuid> {
    crate::repo::parse_uuid(value, column).map_err(TreeRepoError::InvalidData)
}

#[cfg(test)]
mod tests {
    use super::{SqliteTreeRepository, TreeRepository};
    use crate::db::open_db_in_memory;

    #[test]
    fn repository_works_directly_on_a_migrated_connection() {
        let conn = open_db_in_memory().unwrap();
        let tree = SqliteTreeRepository::new(&conn);
        assert!(tree.list_roots().unwrap().is_empty());

        let root = tree.find_or_create_root("rust").unwrap();
        let again = SqliteTreeRepository::new(&conn)
            .find_or_create_root("rust")
            .unwrap();
        assert_eq!(root.id, again.id);
        assert_eq!(tree.list_roots().unwrap().len(), 1);
    }
}
