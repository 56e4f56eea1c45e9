//! Self-organizing category tree use-cases.
//!
//! # Responsibility
//! - File notes into topic leaves by model-guided descent.
//! - Keep leaves and fan-out bounded by splitting, and shrink by merging.
//! - Answer queries by threshold-gated descent over summary embeddings.
//!
//! # Invariants
//! - Only leaves own note memberships.
//! - A split redistributes every membership of the split leaf; none is lost.
//! - Structural changes (splits, merges, membership adds) hold the
//!   structure lock; the store lock is never held across a model call.
//! - Summary failures never fail an insertion; a `refresh_summary` task
//!   retries them.

use crate::config::EngineConfig;
use crate::db::SharedDb;
use crate::model::note::{Note, NoteId};
use crate::model::task::{RefreshSummaryPayload, TaskType};
use crate::model::tree::{TreeNode, TreeNodeId};
use crate::provider::judgment::{complete_partition, parse_groups, parse_selection, Group};
use crate::provider::{embed_text, prompts, LanguageModel, ModelError};
use crate::queue::{TaskQueue, DEFAULT_PRIORITY};
use crate::repo::note_repo::{normalize_tag, NoteRepository, SqliteNoteRepository};
use crate::repo::tree_repo::{SqliteTreeRepository, TreeRepoError, TreeRepository};
use crate::repo::RepoError;
use crate::similarity::{cosine_similarity, Embedding};
use log::{info, warn};
use rusqlite::{Transaction, TransactionBehavior};
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

/// Errors from tree index operations.
#[derive(Debug)]
pub enum TreeServiceError {
    /// Tag is blank after normalization.
    InvalidTag(String),
    NoteNotFound(NoteId),
    NodeNotFound(TreeNodeId),
    /// Descent reached the configured depth cap below `node_id`.
    DepthLimit { node_id: TreeNodeId, depth: usize },
    /// Model call failed while regenerating a summary.
    Model(ModelError),
    /// A fan-out branch panicked.
    BranchPanicked,
    /// Query result could not be serialized.
    Serialize(serde_json::Error),
    Tree(TreeRepoError),
    Repo(RepoError),
}

impl Display for TreeServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidTag(value) => write!(f, "invalid tag: `{value}`"),
            Self::NoteNotFound(id) => write!(f, "note not found: {id}"),
            Self::NodeNotFound(id) => write!(f, "tree node not found: {id}"),
            Self::DepthLimit { node_id, depth } => {
                write!(f, "tree depth limit {depth} reached below node {node_id}")
            }
            Self::Model(err) => write!(f, "{err}"),
            Self::BranchPanicked => write!(f, "tree fan-out branch panicked"),
            Self::Serialize(err) => write!(f, "failed to serialize query result: {err}"),
            Self::Tree(err) => write!(f, "{err}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for TreeServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Model(err) => Some(err),
            Self::Serialize(err) => Some(err),
            Self::Tree(err) => Some(err),
            Self::Repo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TreeRepoError> for TreeServiceError {
    fn from(value: TreeRepoError) -> Self {
        match value {
            TreeRepoError::NodeNotFound(id) => Self::NodeNotFound(id),
            other => Self::Tree(other),
        }
    }
}

impl From<RepoError> for TreeServiceError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::NoteNotFound(id) => Self::NoteNotFound(id),
            other => Self::Repo(other),
        }
    }
}

impl From<rusqlite::Error> for TreeServiceError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Tree(value.into())
    }
}

impl From<ModelError> for TreeServiceError {
    fn from(value: ModelError) -> Self {
        Self::Model(value)
    }
}

pub type TreeServiceResult<T> = Result<T, TreeServiceError>;

/// Leaves a note ended up in after one insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertReport {
    pub note_id: NoteId,
    pub root_id: TreeNodeId,
    pub leaves: Vec<TreeNodeId>,
}

enum LeafInsert {
    /// Leaves now holding the note.
    Inserted(Vec<TreeNodeId>),
    /// The node was split before the membership was written.
    Moved(TreeNode),
}

/// Category tree over the shared store and model.
#[derive(Clone)]
pub struct TreeService {
    db: SharedDb,
    model: Arc<dyn LanguageModel>,
    queue: TaskQueue,
    config: Arc<EngineConfig>,
    structure: Arc<Mutex<()>>,
}

impl TreeService {
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
            structure: Arc::new(Mutex::new(())),
        }
    }

    /// Files one stored note under the root labeled `tag`.
    ///
    /// `summary` routes the note through the tree; when blank, the stored
    /// note summary (or title) is used.
    ///
    /// # Errors
    /// - `InvalidTag` when `tag` is blank.
    /// - `NoteNotFound` for unknown notes.
    /// - The first failing fan-out branch; completed branches stay applied.
    pub fn insert_note(
        &self,
        note_id: NoteId,
        tag: &str,
        summary: &str,
    ) -> TreeServiceResult<InsertReport> {
        let label = normalize_tag(tag).ok_or_else(|| TreeServiceError::InvalidTag(tag.to_string()))?;
        let (note, root) = {
            let conn = self.db.lock();
            let note = SqliteNoteRepository::new(&conn)
                .get_note(note_id)?
                .ok_or(TreeServiceError::NoteNotFound(note_id))?;
            let root = SqliteTreeRepository::new(&conn).find_or_create_root(&label)?;
            (note, root)
        };

        let routing = routing_text(summary, &note);
        let root_id = root.id;
        let leaves = self.descend(root, note_id, &routing, 0)?;
        info!(
            "event=note_insert module=tree status=ok note_id={note_id} root_id={root_id} leaves={}",
            leaves.len()
        );
        Ok(InsertReport {
            note_id,
            root_id,
            leaves,
        })
    }

    fn descend(
        &self,
        node: TreeNode,
        note_id: NoteId,
        summary: &str,
        depth: usize,
    ) -> TreeServiceResult<Vec<TreeNodeId>> {
        if depth >= self.config.max_tree_depth {
            warn!(
                "event=note_insert module=tree status=depth_limit note_id={note_id} node_id={} depth={depth}",
                node.id
            );
            return Err(TreeServiceError::DepthLimit {
                node_id: node.id,
                depth: self.config.max_tree_depth,
            });
        }

        if node.is_leaf {
            return match self.insert_into_leaf(node.id, note_id)? {
                LeafInsert::Inserted(leaves) => Ok(leaves),
                LeafInsert::Moved(node) => self.descend(node, note_id, summary, depth + 1),
            };
        }

        let children = {
            let conn = self.db.lock();
            SqliteTreeRepository::new(&conn).list_children(node.id)?
        };
        if children.is_empty() {
            return match self.insert_into_leaf(node.id, note_id)? {
                LeafInsert::Inserted(leaves) => Ok(leaves),
                LeafInsert::Moved(node) => self.descend(node, note_id, summary, depth + 1),
            };
        }

        let selected = self.select_children(summary, &children);
        let mut picked: Vec<TreeNode> = children
            .into_iter()
            .enumerate()
            .filter(|(index, _)| selected.contains(index))
            .map(|(_, child)| child)
            .collect();

        if picked.len() == 1 {
            let child = picked.remove(0);
            return self.descend(child, note_id, summary, depth + 1);
        }

        let branches: Vec<TreeServiceResult<Vec<TreeNodeId>>> = thread::scope(|scope| {
            let handles: Vec<_> = picked
                .into_iter()
                .map(|child| scope.spawn(move || self.descend(child, note_id, summary, depth + 1)))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(TreeServiceError::BranchPanicked))
                })
                .collect()
        });

        let mut leaves = Vec::new();
        for branch in branches {
            leaves.extend(branch?);
        }
        Ok(leaves)
    }

    /// Asks the model which children fit the note. Falls back to the first
    /// child on model failure or an empty selection.
    fn select_children(&self, summary: &str, children: &[TreeNode]) -> Vec<usize> {
        let described: Vec<(String, String)> = children
            .iter()
            .map(|child| (child.label.clone(), child.summary.clone()))
            .collect();
        match self.model.generate(&prompts::select_children(summary, &described)) {
            Ok(answer) => match parse_selection(&answer, children.len()).ok() {
                Some(selected) if !selected.is_empty() => selected,
                _ => {
                    warn!(
                        "event=child_select module=tree status=fallback reason=unparsed children={}",
                        children.len()
                    );
                    vec![0]
                }
            },
            Err(err) => {
                warn!("event=child_select module=tree status=fallback reason=model error={err}");
                vec![0]
            }
        }
    }

    /// Adds one membership, splitting the leaf when it overflows.
    fn insert_into_leaf(&self, node_id: TreeNodeId, note_id: NoteId) -> TreeServiceResult<LeafInsert> {
        let split = {
            let _structure = self.lock_structure();
            let (node, members) = {
                let conn = self.db.lock();
                let tree = SqliteTreeRepository::new(&conn);
                let node = tree
                    .get_node(node_id)?
                    .ok_or(TreeServiceError::NodeNotFound(node_id))?;
                if !node.is_leaf && tree.count_children(node_id)? > 0 {
                    (node, None)
                } else {
                    if !node.is_leaf {
                        tree.set_leaf(node_id, true)?;
                    }
                    tree.add_member(node_id, note_id)?;
                    let members = tree.count_members(node_id)?;
                    (node, Some(members))
                }
            };
            let Some(members) = members else {
                return Ok(LeafInsert::Moved(node));
            };

            if members > self.config.leaf_split_threshold && self.split_leaf_locked(&node)? {
                self.split_crowded_locked(node_id)?;
                if let Some(parent_id) = node.parent_id {
                    self.split_crowded_locked(parent_id)?;
                }
                true
            } else {
                false
            }
        };

        let leaves = if split {
            info!("event=note_insert module=tree status=leaf_split note_id={note_id} node_id={node_id}");
            self.leaves_under(node_id, note_id)?
        } else {
            vec![node_id]
        };
        self.refresh_upward(node_id);
        Ok(LeafInsert::Inserted(leaves))
    }

    /// Leaves at or below `node_id` that hold `note_id`.
    fn leaves_under(&self, node_id: TreeNodeId, note_id: NoteId) -> TreeServiceResult<Vec<TreeNodeId>> {
        let conn = self.db.lock();
        let tree = SqliteTreeRepository::new(&conn);
        let mut leaves = Vec::new();
        for leaf_id in tree.leaves_containing(note_id)? {
            if leaf_id == node_id || tree.ancestors(leaf_id)?.iter().any(|node| node.id == node_id) {
                leaves.push(leaf_id);
            }
        }
        Ok(leaves)
    }

    /// Splits an overflowing leaf into 2-4 model-chosen groups.
    ///
    /// Returns `false` and leaves the leaf untouched when the model answer
    /// cannot be used. Caller holds the structure lock.
    fn split_leaf_locked(&self, leaf: &TreeNode) -> TreeServiceResult<bool> {
        let notes = {
            let conn = self.db.lock();
            let members = SqliteTreeRepository::new(&conn).list_members(leaf.id)?;
            SqliteNoteRepository::new(&conn).list_notes_by_ids(&members)?
        };
        let summaries: Vec<String> = notes.iter().map(note_summary).collect();

        let answer = match self
            .model
            .generate(&prompts::partition_notes(&leaf.label, &summaries))
        {
            Ok(answer) => answer,
            Err(err) => {
                warn!(
                    "event=leaf_split module=tree status=skipped node_id={} reason=model error={err}",
                    leaf.id
                );
                return Ok(false);
            }
        };
        let Some(groups) = parse_groups(&answer, notes.len())
            .ok()
            .and_then(|groups| complete_partition(groups, notes.len(), false))
        else {
            warn!(
                "event=leaf_split module=tree status=skipped node_id={} reason=unparsed",
                leaf.id
            );
            return Ok(false);
        };

        let prepared: Vec<(String, Vec<NoteId>, Option<(String, Embedding)>)> = groups
            .iter()
            .enumerate()
            .map(|(index, group)| {
                let label = group_label(group, &leaf.label, index);
                let group_summaries: Vec<String> = group
                    .members
                    .iter()
                    .map(|member| summaries[*member].clone())
                    .collect();
                let summary = self
                    .summarize(&prompts::leaf_summary(&label, &group_summaries))
                    .ok();
                let members = group.members.iter().map(|member| notes[*member].id).collect();
                (label, members, summary)
            })
            .collect();

        let created = {
            let conn = self.db.lock();
            let tx = Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)?;
            let tree = SqliteTreeRepository::new(&tx);
            tree.set_leaf(leaf.id, false)?;
            tree.clear_members(leaf.id)?;
            let mut created = Vec::with_capacity(prepared.len());
            for (label, members, summary) in &prepared {
                let child = tree.create_node(leaf.id, label, true)?;
                for note_id in members {
                    tree.add_member(child.id, *note_id)?;
                }
                if let Some((text, embedding)) = summary {
                    tree.update_summary(child.id, text, Some(embedding))?;
                }
                created.push((child.id, summary.is_some()));
            }
            tx.commit()?;
            created
        };

        for (child_id, summarized) in &created {
            if !summarized {
                self.enqueue_refresh(*child_id);
            }
        }
        info!(
            "event=leaf_split module=tree status=ok node_id={} notes={} groups={}",
            leaf.id,
            notes.len(),
            created.len()
        );
        Ok(true)
    }

    /// Groups the children of a crowded node under 2-4 new internal nodes.
    ///
    /// Children are re-parented, not copied. Caller holds the structure lock.
    fn split_crowded_locked(&self, node_id: TreeNodeId) -> TreeServiceResult<bool> {
        let (node, children) = {
            let conn = self.db.lock();
            let tree = SqliteTreeRepository::new(&conn);
            let Some(node) = tree.get_node(node_id)? else {
                return Ok(false);
            };
            if tree.count_children(node_id)? <= self.config.fanout_threshold {
                return Ok(false);
            }
            let children = tree.list_children(node_id)?;
            (node, children)
        };

        let described: Vec<(String, String)> = children
            .iter()
            .map(|child| (child.label.clone(), child.summary.clone()))
            .collect();
        let answer = match self
            .model
            .generate(&prompts::group_children(&node.label, &described))
        {
            Ok(answer) => answer,
            Err(err) => {
                warn!(
                    "event=fanout_split module=tree status=skipped node_id={node_id} reason=model error={err}"
                );
                return Ok(false);
            }
        };
        let Some(groups) = parse_groups(&answer, children.len())
            .ok()
            .and_then(|groups| complete_partition(groups, children.len(), true))
        else {
            warn!("event=fanout_split module=tree status=skipped node_id={node_id} reason=unparsed");
            return Ok(false);
        };

        let prepared: Vec<(String, Vec<TreeNodeId>, Option<(String, Embedding)>)> = groups
            .iter()
            .enumerate()
            .map(|(index, group)| {
                let label = group_label(group, &node.label, index);
                let grouped: Vec<(String, String)> = group
                    .members
                    .iter()
                    .map(|member| described[*member].clone())
                    .collect();
                let summary = self
                    .summarize(&prompts::internal_summary(&label, &grouped))
                    .ok();
                let members = group.members.iter().map(|member| children[*member].id).collect();
                (label, members, summary)
            })
            .collect();

        let created = {
            let conn = self.db.lock();
            let tx = Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)?;
            let tree = SqliteTreeRepository::new(&tx);
            let mut created = Vec::with_capacity(prepared.len());
            for (label, members, summary) in &prepared {
                let group_node = tree.create_node(node_id, label, false)?;
                for child_id in members {
                    tree.reparent(*child_id, group_node.id)?;
                }
                if let Some((text, embedding)) = summary {
                    tree.update_summary(group_node.id, text, Some(embedding))?;
                }
                created.push((group_node.id, summary.is_some()));
            }
            tx.commit()?;
            created
        };

        for (group_id, summarized) in &created {
            if !summarized {
                self.enqueue_refresh(*group_id);
            }
        }
        info!(
            "event=fanout_split module=tree status=ok node_id={node_id} children={} groups={}",
            children.len(),
            created.len()
        );
        Ok(true)
    }

    /// Drops a note from every leaf and merges what becomes sparse.
    ///
    /// An emptied leaf is deleted; an internal node left with one child
    /// absorbs it; an internal node left with none is deleted. Returns the
    /// number of leaves the note was removed from.
    pub fn remove_note(&self, note_id: NoteId) -> TreeServiceResult<usize> {
        let mut survivors = Vec::new();
        let removed = {
            let _structure = self.lock_structure();
            let conn = self.db.lock();
            let tx = Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)?;
            let tree = SqliteTreeRepository::new(&tx);
            let leaves = tree.leaves_containing(note_id)?;
            // Every membership goes before any merge, so an absorbing parent
            // never picks the note back up from a sibling leaf.
            for leaf_id in &leaves {
                tree.remove_member(*leaf_id, note_id)?;
            }
            for leaf_id in &leaves {
                if let Some(survivor) = prune(&tree, *leaf_id)? {
                    if !survivors.contains(&survivor) {
                        survivors.push(survivor);
                    }
                }
            }
            let mut live = Vec::with_capacity(survivors.len());
            for node_id in survivors.drain(..) {
                if tree.get_node(node_id)?.is_some() {
                    live.push(node_id);
                }
            }
            survivors = live;
            tx.commit()?;
            leaves.len()
        };

        for node_id in survivors {
            self.refresh_upward(node_id);
        }
        info!("event=note_remove module=tree status=ok note_id={note_id} leaves={removed}");
        Ok(removed)
    }

    /// Regenerates the summary of `node_id` and every ancestor.
    ///
    /// Task handler for `refresh_summary`. A node deleted in the meantime is
    /// not an error.
    pub fn refresh_summary(&self, node_id: TreeNodeId) -> TreeServiceResult<()> {
        let ancestors = {
            let conn = self.db.lock();
            match SqliteTreeRepository::new(&conn).ancestors(node_id) {
                Ok(ancestors) => ancestors,
                Err(TreeRepoError::NodeNotFound(_)) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        };
        self.refresh_node(node_id)?;
        for ancestor in ancestors {
            self.refresh_node(ancestor.id)?;
        }
        Ok(())
    }

    /// Refreshes upward from `node_id`; on failure queues a retry instead of
    /// surfacing the error.
    fn refresh_upward(&self, node_id: TreeNodeId) {
        if let Err(err) = self.refresh_summary(node_id) {
            warn!(
                "event=summary_refresh module=tree status=deferred node_id={node_id} error={err}"
            );
            self.enqueue_refresh(node_id);
        }
    }

    fn enqueue_refresh(&self, node_id: TreeNodeId) {
        self.queue.enqueue(
            TaskType::RefreshSummary,
            &RefreshSummaryPayload { node_id },
            DEFAULT_PRIORITY,
        );
    }

    /// Regenerates and re-embeds one node summary from its direct content.
    fn refresh_node(&self, node_id: TreeNodeId) -> TreeServiceResult<()> {
        let prompt = {
            let conn = self.db.lock();
            let tree = SqliteTreeRepository::new(&conn);
            let Some(node) = tree.get_node(node_id)? else {
                return Ok(());
            };
            if node.is_leaf {
                let members = tree.list_members(node_id)?;
                let notes = SqliteNoteRepository::new(&conn).list_notes_by_ids(&members)?;
                let summaries: Vec<String> = notes.iter().map(note_summary).collect();
                (!summaries.is_empty()).then(|| prompts::leaf_summary(&node.label, &summaries))
            } else {
                let children: Vec<(String, String)> = tree
                    .list_children(node_id)?
                    .into_iter()
                    .map(|child| (child.label, child.summary))
                    .collect();
                (!children.is_empty()).then(|| prompts::internal_summary(&node.label, &children))
            }
        };

        let (summary, embedding) = match prompt {
            Some(prompt) => {
                let (summary, embedding) = self.summarize(&prompt)?;
                (summary, Some(embedding))
            }
            None => (String::new(), None),
        };

        let conn = self.db.lock();
        match SqliteTreeRepository::new(&conn).update_summary(node_id, &summary, embedding.as_ref()) {
            Ok(()) | Err(TreeRepoError::NodeNotFound(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Generates one summary sentence and its embedding.
    fn summarize(&self, prompt: &str) -> Result<(String, Embedding), ModelError> {
        let summary = self.model.generate(prompt)?.trim().to_string();
        if summary.is_empty() {
            return Err(ModelError::MalformedResponse("summary is empty".to_string()));
        }
        let embedding = embed_text(self.model.as_ref(), &summary)?;
        Ok((summary, embedding))
    }

    /// Notes reached by threshold-gated descent, in creation order.
    pub fn query(&self, text: &str) -> TreeServiceResult<Vec<Note>> {
        let query = match embed_text(self.model.as_ref(), text) {
            Ok(embedding) => Some(embedding),
            Err(err) => {
                warn!("event=tree_query module=tree status=fallback reason=query_embedding error={err}");
                None
            }
        };
        let roots = {
            let conn = self.db.lock();
            SqliteTreeRepository::new(&conn).list_roots()?
        };

        let collected = Mutex::new(HashSet::new());
        self.collect_level(roots, query.as_ref(), &collected, 0)?;

        let note_ids: Vec<NoteId> = collected
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_iter()
            .collect();
        let notes = {
            let conn = self.db.lock();
            SqliteNoteRepository::new(&conn).list_notes_by_ids(&note_ids)?
        };
        info!("event=tree_query module=tree status=ok matches={}", notes.len());
        Ok(notes)
    }

    /// `query` serialized as a JSON array; `[]` when nothing matches.
    pub fn query_json(&self, text: &str) -> TreeServiceResult<String> {
        let notes = self.query(text)?;
        serde_json::to_string(&notes).map_err(TreeServiceError::Serialize)
    }

    fn collect_level(
        &self,
        nodes: Vec<TreeNode>,
        query: Option<&Embedding>,
        collected: &Mutex<HashSet<NoteId>>,
        depth: usize,
    ) -> TreeServiceResult<()> {
        if nodes.is_empty() || depth > self.config.max_tree_depth {
            return Ok(());
        }

        let selected = gate_by_similarity(nodes, query, self.model.model_id(), self.config.query_threshold);
        let mut internal = Vec::new();
        for node in selected {
            if node.is_leaf {
                let members = {
                    let conn = self.db.lock();
                    SqliteTreeRepository::new(&conn).list_members(node.id)?
                };
                collected
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend(members);
            } else {
                internal.push(node);
            }
        }

        let branches: Vec<TreeServiceResult<()>> = thread::scope(|scope| {
            let handles: Vec<_> = internal
                .into_iter()
                .map(|node| {
                    scope.spawn(move || {
                        let children = {
                            let conn = self.db.lock();
                            SqliteTreeRepository::new(&conn).list_children(node.id)?
                        };
                        self.collect_level(children, query, collected, depth + 1)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(TreeServiceError::BranchPanicked))
                })
                .collect()
        });
        branches.into_iter().collect()
    }

    /// Root categories, oldest first.
    pub fn list_roots(&self) -> TreeServiceResult<Vec<TreeNode>> {
        let conn = self.db.lock();
        Ok(SqliteTreeRepository::new(&conn).list_roots()?)
    }

    pub fn list_children(&self, node_id: TreeNodeId) -> TreeServiceResult<Vec<TreeNode>> {
        let conn = self.db.lock();
        Ok(SqliteTreeRepository::new(&conn).list_children(node_id)?)
    }

    pub fn list_members(&self, node_id: TreeNodeId) -> TreeServiceResult<Vec<NoteId>> {
        let conn = self.db.lock();
        Ok(SqliteTreeRepository::new(&conn).list_members(node_id)?)
    }

    pub fn get_node(&self, node_id: TreeNodeId) -> TreeServiceResult<TreeNode> {
        let conn = self.db.lock();
        SqliteTreeRepository::new(&conn)
            .get_node(node_id)?
            .ok_or(TreeServiceError::NodeNotFound(node_id))
    }

    fn lock_structure(&self) -> MutexGuard<'_, ()> {
        self.structure.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keeps nodes whose summary embedding meets `threshold`.
///
/// Selects every node when the query embedding or any node embedding is
/// missing or stale.
fn gate_by_similarity(
    nodes: Vec<TreeNode>,
    query: Option<&Embedding>,
    model_id: &str,
    threshold: f64,
) -> Vec<TreeNode> {
    let Some(query) = query.filter(|query| query.is_current(model_id)) else {
        return nodes;
    };
    if nodes.iter().any(|node| node.current_embedding(model_id).is_none()) {
        return nodes;
    }
    nodes
        .into_iter()
        .filter(|node| {
            node.current_embedding(model_id)
                .map(|embedding| cosine_similarity(&query.values, &embedding.values) >= threshold)
                .unwrap_or(true)
        })
        .collect()
}

/// Deletes emptied nodes upward from `node_id` and absorbs single children.
///
/// Returns the nearest surviving node whose summary is now stale.
fn prune(
    tree: &SqliteTreeRepository<'_>,
    node_id: TreeNodeId,
) -> TreeServiceResult<Option<TreeNodeId>> {
    let mut current = node_id;
    loop {
        let Some(node) = tree.get_node(current)? else {
            return Ok(None);
        };
        let empty = if node.is_leaf {
            tree.count_members(current)? == 0
        } else {
            match tree.count_children(current)? {
                0 => true,
                1 => {
                    absorb_only_child(tree, &node)?;
                    return Ok(Some(current));
                }
                _ => false,
            }
        };
        if !empty {
            return Ok(Some(current));
        }
        tree.delete_node(current)?;
        match node.parent_id {
            Some(parent_id) => current = parent_id,
            None => return Ok(None),
        }
    }
}

/// Moves the single child's content into `node` and deletes the child.
fn absorb_only_child(tree: &SqliteTreeRepository<'_>, node: &TreeNode) -> TreeServiceResult<()> {
    let mut children = tree.list_children(node.id)?;
    let Some(child) = children.pop() else {
        return Ok(());
    };
    if child.is_leaf {
        for note_id in tree.list_members(child.id)? {
            tree.add_member(node.id, note_id)?;
        }
        tree.set_leaf(node.id, true)?;
    } else {
        for grandchild in tree.list_children(child.id)? {
            tree.reparent(grandchild.id, node.id)?;
        }
    }
    tree.update_summary(node.id, &child.summary, child.embedding.as_ref())?;
    tree.delete_node(child.id)?;
    Ok(())
}

fn routing_text(summary: &str, note: &Note) -> String {
    if !summary.trim().is_empty() {
        return summary.trim().to_string();
    }
    note_summary(note)
}

fn note_summary(note: &Note) -> String {
    if note.summary.trim().is_empty() {
        note.title.clone()
    } else {
        note.summary.clone()
    }
}

fn group_label(group: &Group, parent_label: &str, index: usize) -> String {
    let label = group.label.trim();
    if label.is_empty() {
        format!("{parent_label}-{}", index + 1)
    } else {
        label.to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::{gate_by_similarity, group_label};
    use crate::model::tree::TreeNode;
    use crate::provider::judgment::Group;
    use crate::similarity::Embedding;
    use uuid::Uuid;

    fn node(label: &str, embedding: Option<Embedding>) -> TreeNode {
        TreeNode {
            id: Uuid::new_v4(),
            label: label.to_string(),
            summary: String::new(),
            is_leaf: true,
            parent_id: None,
            embedding,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn gate_keeps_nodes_at_or_above_threshold() {
        let query = Embedding::new(vec![1.0, 0.0], "m");
        let nodes = vec![
            node("near", Some(Embedding::new(vec![1.0, 0.1], "m"))),
            node("far", Some(Embedding::new(vec![0.0, 1.0], "m"))),
        ];
        let kept = gate_by_similarity(nodes, Some(&query), "m", 0.5);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].label, "near");
    }

    #[test]
    fn gate_selects_all_when_any_embedding_is_stale_or_missing() {
        let query = Embedding::new(vec![1.0, 0.0], "m");
        let nodes = vec![
            node("near", Some(Embedding::new(vec![1.0, 0.0], "m"))),
            node("stale", Some(Embedding::new(vec![0.0, 1.0], "old"))),
        ];
        assert_eq!(gate_by_similarity(nodes, Some(&query), "m", 0.5).len(), 2);

        let nodes = vec![node("a", None), node("b", None)];
        assert_eq!(gate_by_similarity(nodes, None, "m", 0.99).len(), 2);
    }

    #[test]
    fn blank_group_labels_fall_back_to_parent_label() {
        let group = Group {
            label: "  ".to_string(),
            members: vec![0],
        };
        assert_eq!(group_label(&group, "rust", 1), "rust-2");
        let group = Group {
            label: " Async IO ".to_string(),
            members: vec![0],
        };
        assert_eq!(group_label(&group, "rust", 0), "async io");
    }
}
