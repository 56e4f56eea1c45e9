//! Notes and their tags.
//!
//! Note and tag rows are written in one transaction. Reads fold the tags into
//! the note row, so batch loads are a single query ordered by
//! `created_at ASC, rowid ASC`.

use crate::model::note::{NewNote, Note, NoteId};
use crate::repo::{parse_uuid, RepoError, RepoResult};
use once_cell::sync::Lazy;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row, Transaction, TransactionBehavior};
use std::collections::BTreeSet;
use uuid::Uuid;

const TAG_SEPARATOR: char = '\u{1f}';

static NOTE_COLUMNS: Lazy<String> = Lazy::new(|| {
    format!(
        "note_uuid, title, body, summary, created_at, updated_at,
         (SELECT group_concat(t.tag, char({sep}))
            FROM note_tags t
            WHERE t.note_uuid = notes.note_uuid) AS tag_list",
        sep = TAG_SEPARATOR as u32
    )
});

/// Repository interface for notes.
pub trait NoteRepository {
    /// Creates one note with normalized tags and returns it.
    fn create_note(&self, note: &NewNote) -> RepoResult<Note>;
    fn get_note(&self, id: NoteId) -> RepoResult<Option<Note>>;
    /// Loads the notes that exist among `ids`; unknown ids are skipped.
    fn list_notes_by_ids(&self, ids: &[NoteId]) -> RepoResult<Vec<Note>>;
}

/// SQLite-backed note repository.
pub struct SqliteNoteRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteNoteRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl NoteRepository for SqliteNoteRepository<'_> {
    fn create_note(&self, note: &NewNote) -> RepoResult<Note> {
        let id = Uuid::new_v4();
        let id_text = id.to_string();
        let tags = normalize_tags(&note.tags);

        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO notes (note_uuid, title, body, summary) VALUES (?1, ?2, ?3, ?4);",
            params![
                id_text.as_str(),
                note.title.trim(),
                note.body.as_str(),
                note.summary.trim(),
            ],
        )?;
        for tag in &tags {
            tx.execute(
                "INSERT OR IGNORE INTO note_tags (note_uuid, tag) VALUES (?1, ?2);",
                params![id_text.as_str(), tag.as_str()],
            )?;
        }
        tx.commit()?;

        self.get_note(id)?.ok_or(RepoError::NoteNotFound(id))
    }

    fn get_note(&self, id: NoteId) -> RepoResult<Option<Note>> {
        let sql = format!("SELECT {} FROM notes WHERE note_uuid = ?1;", *NOTE_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([id.to_string()])?;
        rows.next()?.map(parse_note_row).transpose()
    }

    fn list_notes_by_ids(&self, ids: &[NoteId]) -> RepoResult<Vec<Note>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM notes
             WHERE note_uuid IN ({placeholders})
             ORDER BY created_at ASC, rowid ASC;",
            *NOTE_COLUMNS
        );
        let bind_values: Vec<Value> = ids.iter().map(|id| Value::Text(id.to_string())).collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut notes = Vec::with_capacity(ids.len());
        while let Some(row) = rows.next()? {
            notes.push(parse_note_row(row)?);
        }
        Ok(notes)
    }
}

/// Normalizes one tag value. Returns `None` for blank input.
pub fn normalize_tag(tag: &str) -> Option<String> {
    let trimmed = tag.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

/// Normalizes, deduplicates and sorts tag values.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut unique = BTreeSet::new();
    for tag in tags {
        if let Some(value) = normalize_tag(tag) {
            unique.insert(value);
        }
    }
    unique.into_iter().collect()
}

fn parse_note_row(row: &Row<'_>) -> RepoResult<Note> {
    let id_text: String = row.get("note_uuid")?;
    let tag_list: Option<String> = row.get("tag_list")?;
    let mut tags: Vec<String> = tag_list
        .map(|joined| joined.split(TAG_SEPARATOR).map(str::to_string).collect())
        .unwrap_or_default();
    tags.sort();
    Ok(Note {
        id: parse_uuid(&id_text, "notes.note_uuid").map_err(RepoError::InvalidData)?,
        title: row.get("title")?,
        body: row.get("body")?,
        tags,
        summary: row.get("summary")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::{normalize_tag, normalize_tags};

    #[test]
    fn normalize_tags_trims_lowercases_and_dedupes() {
        let tags = vec![
            " Rust ".to_string(),
            "rust".to_string(),
            "".to_string(),
            "DB".to_string(),
        ];
        assert_eq!(normalize_tags(&tags), vec!["db".to_string(), "rust".to_string()]);
        assert_eq!(normalize_tag("   "), None);
    }
}
