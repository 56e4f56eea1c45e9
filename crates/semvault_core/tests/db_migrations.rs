use rusqlite::Connection;
use semvault_core::db::migrations::{latest_version, schema_version};
use semvault_core::db::{open_db, open_db_in_memory, DbError};

#[test]
fn open_db_in_memory_applies_all_migrations() {
    let conn = open_db_in_memory().unwrap();

    assert_eq!(schema_version(&conn).unwrap(), latest_version());
    for table in [
        "statements",
        "issues",
        "issue_events",
        "tasks",
        "notes",
        "note_tags",
        "tree_nodes",
        "tree_members",
    ] {
        assert_table_exists(&conn, table);
    }
}

#[test]
fn opening_same_database_twice_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("semvault.db");

    let conn_first = open_db(&path).unwrap();
    assert_eq!(schema_version(&conn_first).unwrap(), latest_version());
    drop(conn_first);

    let conn_second = open_db(&path).unwrap();
    assert_eq!(schema_version(&conn_second).unwrap(), latest_version());
    assert_table_exists(&conn_second, "statements");
}

#[test]
fn opening_database_with_newer_schema_version_returns_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.db");

    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("PRAGMA user_version = 999;").unwrap();
    drop(conn);

    let err = open_db(&path).unwrap_err();
    match err {
        DbError::UnsupportedSchemaVersion {
            db_version,
            latest_supported,
        } => {
            assert_eq!(db_version, 999);
            assert_eq!(latest_supported, latest_version());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn unresolved_issue_pair_is_unique_but_resolved_rows_may_repeat() {
    let conn = open_db_in_memory().unwrap();
    conn.execute_batch(
        "INSERT INTO statements (statement_uuid, text, source, source_type, status)
         VALUES ('a', 'one', 's', 't', 'active'), ('b', 'two', 's', 't', 'active');
         INSERT INTO issues (statement_a, statement_b, kind, status)
         VALUES ('a', 'b', 'duplicate', 'resolved');
         INSERT INTO issues (statement_a, statement_b, kind, status)
         VALUES ('a', 'b', 'duplicate', 'pending');",
    )
    .unwrap();

    let duplicate = conn.execute(
        "INSERT INTO issues (statement_a, statement_b, kind, status)
         VALUES ('a', 'b', 'contradiction', 'open');",
        [],
    );
    assert!(duplicate.is_err());
}

#[test]
fn partially_migrated_database_is_brought_forward() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("partial.db");

    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(include_str!("../src/db/migrations/0001_consistency.sql"))
        .unwrap();
    conn.execute_batch("PRAGMA user_version = 1;").unwrap();
    drop(conn);

    let conn = open_db(&path).unwrap();
    assert_eq!(schema_version(&conn).unwrap(), latest_version());
    assert_table_exists(&conn, "tree_nodes");
}

#[test]
fn foreign_keys_are_enforced() {
    let conn = open_db_in_memory().unwrap();
    let orphan = conn.execute(
        "INSERT INTO tree_members (node_uuid, note_uuid) VALUES ('missing', 'missing');",
        [],
    );
    assert!(orphan.is_err());
}

fn assert_table_exists(conn: &Connection, table_name: &str) {
    let exists: i64 = conn
        .query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM sqlite_master
                WHERE type = 'table' AND name = ?1
            );",
            [table_name],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(exists, 1, "table {table_name} does not exist");
}
