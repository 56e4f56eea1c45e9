//! Ordered schema steps, tracked through `PRAGMA user_version`.
//!
//! Every pending step runs inside one transaction together with the version
//! bump, so a failed step leaves the schema at the previous version.

use crate::db::{DbError, DbResult};
use log::info;
use rusqlite::Connection;

struct SchemaStep {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const SCHEMA_STEPS: [SchemaStep; 2] = [
    SchemaStep {
        version: 1,
        name: "consistency",
        sql: include_str!("0001_consistency.sql"),
    },
    SchemaStep {
        version: 2,
        name: "tree_index",
        sql: include_str!("0002_tree_index.sql"),
    },
];

/// Highest schema version this build can produce.
pub fn latest_version() -> u32 {
    SCHEMA_STEPS.iter().map(|step| step.version).max().unwrap_or(0)
}

/// Version currently recorded in the database header.
pub fn schema_version(conn: &Connection) -> DbResult<u32> {
    Ok(conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?)
}

/// Brings the schema up to `latest_version()`.
///
/// # Errors
/// - `UnsupportedSchemaVersion` when the file was written by a newer build.
/// - `Migration` naming the first step that failed; nothing is applied then.
pub fn apply_migrations(conn: &mut Connection) -> DbResult<()> {
    let from = schema_version(conn)?;
    let latest = latest_version();
    if from > latest {
        return Err(DbError::UnsupportedSchemaVersion {
            db_version: from,
            latest_supported: latest,
        });
    }

    let pending: Vec<&SchemaStep> = SCHEMA_STEPS
        .iter()
        .filter(|step| step.version > from)
        .collect();
    if pending.is_empty() {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for step in &pending {
        let batch = format!("{}\nPRAGMA user_version = {};", step.sql, step.version);
        tx.execute_batch(&batch)
            .map_err(|source| DbError::Migration {
                version: step.version,
                name: step.name,
                source,
            })?;
    }
    tx.commit()?;

    info!(
        "event=db_migrate module=db status=ok from_version={from} to_version={latest} steps={}",
        pending.len()
    );
    Ok(())
}
