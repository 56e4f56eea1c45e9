//! Engine configuration.
//!
//! # Responsibility
//! - Hold every threshold, limit and interval the engine uses.
//! - Parse TOML overrides and reject out-of-range values.
//!
//! # Invariants
//! - A validated config has similarity thresholds in `[-1, 1]`, non-zero
//!   intervals and split thresholds of at least 2.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

/// How ingestion looks for conflicting statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateStrategy {
    /// Record a pending issue for every active statement above threshold.
    MathOnly,
    /// Ask the model whether each of the top-K neighbours contradicts.
    Judgment,
}

/// Runtime configuration for one engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Statement size limit in UTF-8 bytes.
    pub max_statement_bytes: usize,
    /// Cosine similarity at or above which two statements conflict.
    pub duplicate_threshold: f64,
    pub duplicate_strategy: DuplicateStrategy,
    /// Neighbours judged per statement under `DuplicateStrategy::Judgment`.
    pub judgment_top_k: usize,
    /// Cosine similarity a node summary needs for query descent.
    pub query_threshold: f64,
    /// A leaf with more members than this is split.
    pub leaf_split_threshold: usize,
    /// A node with more children than this is split.
    pub fanout_threshold: usize,
    pub max_tree_depth: usize,
    pub task_max_attempts: u32,
    pub poll_interval_ms: u64,
    pub shutdown_grace_ms: u64,
    /// Completed tasks older than this are purged by the maintenance sweep.
    pub completed_task_retention_ms: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_statement_bytes: 4096,
            duplicate_threshold: 0.92,
            duplicate_strategy: DuplicateStrategy::MathOnly,
            judgment_top_k: 5,
            query_threshold: 0.5,
            leaf_split_threshold: 10,
            fanout_threshold: 8,
            max_tree_depth: 16,
            task_max_attempts: 3,
            poll_interval_ms: 500,
            shutdown_grace_ms: 5000,
            completed_task_retention_ms: 86_400_000,
        }
    }
}

impl EngineConfig {
    /// Parses a TOML document; missing keys keep their defaults.
    ///
    /// # Errors
    /// - `Parse` for malformed TOML or unknown keys.
    /// - `Invalid` when a value fails `validate`.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("duplicate_threshold", self.duplicate_threshold),
            ("query_threshold", self.query_threshold),
        ] {
            if !(-1.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be within [-1, 1], got {value}"
                )));
            }
        }
        if self.max_statement_bytes == 0 {
            return Err(invalid("max_statement_bytes must be positive"));
        }
        if self.judgment_top_k == 0 {
            return Err(invalid("judgment_top_k must be positive"));
        }
        if self.leaf_split_threshold < 2 {
            return Err(invalid("leaf_split_threshold must be at least 2"));
        }
        if self.fanout_threshold < 2 {
            return Err(invalid("fanout_threshold must be at least 2"));
        }
        if self.max_tree_depth == 0 {
            return Err(invalid("max_tree_depth must be positive"));
        }
        if self.task_max_attempts == 0 {
            return Err(invalid("task_max_attempts must be positive"));
        }
        if self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms must be positive"));
        }
        if self.completed_task_retention_ms < 0 {
            return Err(invalid("completed_task_retention_ms must not be negative"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}

#[derive(Debug)]
pub enum ConfigError {
    Parse(toml::de::Error),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(err) => write!(f, "invalid engine config: {err}"),
            Self::Invalid(message) => write!(f, "invalid engine config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, DuplicateStrategy, EngineConfig};

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn toml_overrides_selected_keys() {
        let config = EngineConfig::from_toml_str(
            "duplicate_threshold = 0.8\nduplicate_strategy = \"judgment\"\nleaf_split_threshold = 4\n",
        )
        .unwrap();
        assert_eq!(config.duplicate_threshold, 0.8);
        assert_eq!(config.duplicate_strategy, DuplicateStrategy::Judgment);
        assert_eq!(config.leaf_split_threshold, 4);
        assert_eq!(config.fanout_threshold, EngineConfig::default().fanout_threshold);
    }

    #[test]
    fn rejects_out_of_range_and_unknown_keys() {
        assert!(matches!(
            EngineConfig::from_toml_str("query_threshold = 1.5"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("leaf_split_threshold = 1"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("bogus = 1"),
            Err(ConfigError::Parse(_))
        ));
    }
}
