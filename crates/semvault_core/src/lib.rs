//! Core of SemVault, an embedded semantic store.
//!
//! Statements pass through a consistency layer that detects duplicates and
//! contradictions; notes are filed into a self-organizing category tree.
//! This crate is the single source of truth for both sets of invariants.

pub mod config;
pub mod db;
pub mod engine;
pub mod logging;
pub mod model;
pub mod provider;
pub mod queue;
pub mod repo;
pub mod service;
pub mod similarity;
pub mod worker;

pub use config::{ConfigError, DuplicateStrategy, EngineConfig};
pub use db::{open_db, open_db_in_memory, DbError, SharedDb};
pub use engine::{Engine, EngineError, EngineResult};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::issue::{Issue, IssueId, IssueKind, IssueStatus, Resolution};
pub use model::note::{NewNote, Note, NoteId};
pub use model::statement::{Statement, StatementId, StatementStatus};
pub use model::task::{Task, TaskCounts, TaskId, TaskStatus, TaskType};
pub use model::tree::{TreeNode, TreeNodeId};
pub use provider::{LanguageModel, ModelError};
pub use queue::TaskQueue;
pub use service::consistency_service::{
    ConsistencyError, PromotionOutcome, ResolutionOutcome, ScoredStatement,
};
pub use service::tree_service::{InsertReport, TreeServiceError};
pub use similarity::{cosine_similarity, Embedding};
pub use worker::{ShutdownReport, StopSignal, WorkerPool};

/// Minimal health-check API for host integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::{core_version, ping};

    #[test]
    fn ping_returns_pong() {
        assert_eq!(ping(), "pong");
    }

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
