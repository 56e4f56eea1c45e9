//! Administration CLI for SemVault stores.
//!
//! # Responsibility
//! - Inspect a store (tasks, issues, tree roots) and print JSON.
//! - Resolve review issues and validate config files.
//!
//! The CLI never calls a model; it opens the engine with an offline model
//! so model-dependent work stays queued for a real host.

use clap::{Parser, Subcommand};
use semvault_core::{
    init_logging, Engine, EngineConfig, LanguageModel, ModelError, TaskId,
};
use serde_json::json;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "semvault")]
#[command(about = "Inspect and administer a SemVault store")]
struct Cli {
    /// Absolute directory for rolling log files
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print core version and a health check
    Ping,

    /// Task counts, open issue count and root categories
    Status {
        /// SQLite database file
        #[arg(long)]
        db: PathBuf,
    },

    /// List pending and open issues
    Issues {
        #[arg(long)]
        db: PathBuf,
    },

    /// Resolve one issue
    Resolve {
        #[arg(long)]
        db: PathBuf,

        /// Issue id
        #[arg(long)]
        issue: i64,

        /// keep_a | keep_b | keep_both | delete_both
        #[arg(long)]
        action: String,
    },

    /// Show one queued task
    Task {
        #[arg(long)]
        db: PathBuf,

        #[arg(long)]
        id: TaskId,
    },

    /// Validate a TOML config file and print the effective values
    CheckConfig {
        /// Config file path
        path: PathBuf,
    },
}

/// Model stand-in that reports itself unavailable.
struct OfflineModel;

impl LanguageModel for OfflineModel {
    fn model_id(&self) -> &str {
        "offline"
    }

    fn generate(&self, _prompt: &str) -> Result<String, ModelError> {
        Err(ModelError::Unavailable("semvault cli runs offline".to_string()))
    }

    fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f64>>, ModelError> {
        Err(ModelError::Unavailable("semvault cli runs offline".to_string()))
    }
}

fn open_engine(db: &PathBuf) -> Result<Engine, Box<dyn Error>> {
    Ok(Engine::open(db, Arc::new(OfflineModel), EngineConfig::default())?)
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    if let Some(log_dir) = &cli.log_dir {
        init_logging(semvault_core::default_log_level(), log_dir)?;
    }

    let output = match cli.command {
        Commands::Ping => json!({
            "ping": semvault_core::ping(),
            "version": semvault_core::core_version(),
        }),
        Commands::Status { db } => {
            let engine = open_engine(&db)?;
            let roots: Vec<String> = engine
                .list_roots()?
                .into_iter()
                .map(|root| root.label)
                .collect();
            json!({
                "tasks": engine.task_counts()?,
                "open_issues": engine.list_open_issues()?.len(),
                "roots": roots,
            })
        }
        Commands::Issues { db } => serde_json::to_value(open_engine(&db)?.list_open_issues()?)?,
        Commands::Resolve { db, issue, action } => {
            serde_json::to_value(open_engine(&db)?.resolve_issue_str(issue, &action)?)?
        }
        Commands::Task { db, id } => serde_json::to_value(open_engine(&db)?.get_task(id)?)?,
        Commands::CheckConfig { path } => {
            let source = std::fs::read_to_string(&path)?;
            serde_json::to_value(EngineConfig::from_toml_str(&source)?)?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
