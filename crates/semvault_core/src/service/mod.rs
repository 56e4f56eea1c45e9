//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate repository and model calls into use-case level APIs.
//! - Own lock discipline: repositories run under the store lock, model calls
//!   never do.

pub mod consistency_service;
pub mod note_service;
pub mod tree_service;
