//! Domain model for statements, issues, tasks, notes and the category tree.
//!
//! # Responsibility
//! - Define canonical data structures used by services and repositories.
//! - Own lifecycle enums and their stable text encodings.
//!
//! # Invariants
//! - Every statement, note and tree node is identified by a random UUID.
//! - Text encodings (`as_str`/`parse`) match the values stored in SQLite.

pub mod issue;
pub mod note;
pub mod statement;
pub mod task;
pub mod tree;
