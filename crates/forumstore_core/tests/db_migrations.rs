use forumstore_core::db::migrations::latest_version;
use forumstore_core::db::{open_db, open_db_in_memory, DbError};
use forumstore_core::{Store, StoreConfig, StoreError, StoreLocation};
use rusqlite::Connection;

#[test]
fn open_db_in_memory_applies_all_migrations() {
    let conn = open_db_in_memory().unwrap();

    assert_eq!(schema_version(&conn), latest_version());
    assert_table_exists(&conn, "entities");
    assert_column_exists(&conn, "entities", "version");
}

#[test]
fn opening_same_database_twice_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("forumstore.db");

    let conn_first = open_db(&path).unwrap();
    assert_eq!(schema_version(&conn_first), latest_version());
    drop(conn_first);

    let conn_second = open_db(&path).unwrap();
    assert_eq!(schema_version(&conn_second), latest_version());
    assert_table_exists(&conn_second, "entities");
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

    match Store::open(&StoreConfig::file(&path)) {
        Err(StoreError::Db(DbError::UnsupportedSchemaVersion { .. })) => {}
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("store must refuse a newer schema"),
    }
}

#[test]
fn from_connection_rejects_unmigrated_connection() {
    let conn = Connection::open_in_memory().unwrap();

    match Store::from_connection(conn, StoreLocation::Memory) {
        Err(StoreError::UninitializedConnection {
            expected_version,
            actual_version,
        }) => {
            assert_eq!(expected_version, latest_version());
            assert_eq!(actual_version, 0);
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("unmigrated connection must be rejected"),
    }
}

#[test]
fn from_connection_rejects_missing_table_and_column() {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(&format!("PRAGMA user_version = {};", latest_version()))
        .unwrap();
    assert!(matches!(
        Store::from_connection(conn, StoreLocation::Memory),
        Err(StoreError::MissingRequiredTable("entities"))
    ));

    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(&format!(
        "CREATE TABLE entities (
            id TEXT PRIMARY KEY NOT NULL,
            entity_name TEXT NOT NULL,
            fields TEXT NOT NULL,
            created_at INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL DEFAULT 0
        );
        PRAGMA user_version = {};",
        latest_version()
    ))
    .unwrap();
    assert!(matches!(
        Store::from_connection(conn, StoreLocation::Memory),
        Err(StoreError::MissingRequiredColumn {
            table: "entities",
            column: "version"
        })
    ));
}

#[test]
fn from_connection_accepts_migrated_connection() {
    let conn = open_db_in_memory().unwrap();
    let store = Store::from_connection(conn, StoreLocation::Memory).unwrap();

    assert_eq!(store.location(), &StoreLocation::Memory);
    assert!(store.collection_counts().unwrap().is_empty());
}

fn schema_version(conn: &Connection) -> u32 {
    conn.query_row("PRAGMA user_version;", [], |row| row.get(0))
        .unwrap()
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

fn assert_column_exists(conn: &Connection, table_name: &str, column: &str) {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name});"))
        .unwrap();
    let columns: Vec<String> = stmt
        .query_map([], |row| row.get(1))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert!(
        columns.iter().any(|name| name == column),
        "column {column} missing from {table_name}"
    );
}
