//! Note use-case service.
//!
//! # Responsibility
//! - Validate and persist notes filed by the category tree.
//! - Normalize tags before they reach storage.
//!
//! # Invariants
//! - Titles are non-blank after trim.
//! - Tag names are normalized to lowercase and deduplicated.

use crate::db::SharedDb;
use crate::model::note::{NewNote, Note, NoteId};
use crate::repo::note_repo::{NoteRepository, SqliteNoteRepository};
use crate::repo::RepoError;
use log::info;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Service error for note use-cases.
#[derive(Debug)]
pub enum NoteServiceError {
    /// Title is blank after trim.
    BlankTitle,
    /// Target note does not exist.
    NoteNotFound(NoteId),
    /// Persistence-layer failure.
    Repo(RepoError),
}

impl Display for NoteServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlankTitle => write!(f, "note title must not be blank"),
            Self::NoteNotFound(id) => write!(f, "note not found: {id}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for NoteServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RepoError> for NoteServiceError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::NoteNotFound(id) => Self::NoteNotFound(id),
            other => Self::Repo(other),
        }
    }
}

/// Note service over the shared store.
#[derive(Clone)]
pub struct NoteService {
    db: SharedDb,
}

impl NoteService {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }

    /// Creates one note.
    pub fn create_note(&self, note: &NewNote) -> Result<Note, NoteServiceError> {
        if note.title.trim().is_empty() {
            return Err(NoteServiceError::BlankTitle);
        }
        let created = {
            let conn = self.db.lock();
            SqliteNoteRepository::new(&conn).create_note(note)?
        };
        info!(
            "event=note_create module=note status=ok note_id={} tags={}",
            created.id,
            created.tags.len()
        );
        Ok(created)
    }

    pub fn get_note(&self, id: NoteId) -> Result<Note, NoteServiceError> {
        let conn = self.db.lock();
        SqliteNoteRepository::new(&conn)
            .get_note(id)?
            .ok_or(NoteServiceError::NoteNotFound(id))
    }

    /// Loads the notes that exist among `ids`, oldest first.
    pub fn list_notes_by_ids(&self, ids: &[NoteId]) -> Result<Vec<Note>, NoteServiceError> {
        let conn = self.db.lock();
        Ok(SqliteNoteRepository::new(&conn).list_notes_by_ids(ids)?)
    }
}
