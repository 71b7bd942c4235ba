//! SQLite schema for a collection database
//!
//! One database file per collection. Revision trees, the change feed, the
//! sequence high-water mark and replication checkpoints live side by side so
//! each mutation commits atomically with its feed entry.

use rusqlite::{Connection, Result};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Revision tree nodes, one row per revision
        CREATE TABLE IF NOT EXISTS revisions (
            doc_id TEXT NOT NULL,
            generation INTEGER NOT NULL,
            hash TEXT NOT NULL,
            parent_generation INTEGER,
            parent_hash TEXT,
            deleted INTEGER NOT NULL DEFAULT 0,
            body TEXT,
            PRIMARY KEY (doc_id, generation, hash)
        );

        -- Append-only change feed
        CREATE TABLE IF NOT EXISTS changes (
            seq INTEGER PRIMARY KEY,
            doc_id TEXT NOT NULL,
            generation INTEGER NOT NULL,
            hash TEXT NOT NULL,
            deleted INTEGER NOT NULL DEFAULT 0,
            committed_at INTEGER NOT NULL,
            origin TEXT
        );

        -- Remote revisions held back while their document is quarantined
        CREATE TABLE IF NOT EXISTS deferred (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            doc_id TEXT NOT NULL,
            generation INTEGER NOT NULL,
            hash TEXT NOT NULL,
            parent_generation INTEGER,
            parent_hash TEXT,
            deleted INTEGER NOT NULL DEFAULT 0,
            body TEXT,
            origin TEXT,
            UNIQUE (doc_id, generation, hash)
        );

        -- Process-wide counters (sequence high-water mark)
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        );

        -- Replication progress per peer and direction
        CREATE TABLE IF NOT EXISTS checkpoints (
            peer_id TEXT NOT NULL,
            direction TEXT NOT NULL,
            seq INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (peer_id, direction)
        );

        -- Feed lookups by document
        CREATE INDEX IF NOT EXISTS idx_changes_doc_id ON changes(doc_id);
        "#,
    )?;

    // Version 1 databases predate the origin column
    if !has_column(conn, "changes", "origin")? {
        conn.execute("ALTER TABLE changes ADD COLUMN origin TEXT", [])?;
    }

    conn.execute(
        "INSERT OR IGNORE INTO meta (key, value) VALUES ('last_seq', 0)",
        [],
    )?;

    // Set schema version
    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    conn.prepare("SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2")?
        .exists([table, column])
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_info WHERE key = 'version'")?;
    let result: Result<String> = stmt.query_row([], |row| row.get(0));

    match result {
        Ok(version_str) => Ok(version_str.parse().ok()),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if schema needs initialization or migration
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_info'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    match get_schema_version(conn) {
        Ok(Some(v)) => v < SCHEMA_VERSION,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"revisions".to_string()));
        assert!(tables.contains(&"changes".to_string()));
        assert!(tables.contains(&"meta".to_string()));
        assert!(tables.contains(&"checkpoints".to_string()));
        assert!(tables.contains(&"deferred".to_string()));
    }

    #[test]
    fn test_schema_version() {
        let conn = Connection::open_in_memory().unwrap();

        assert!(needs_init(&conn));

        init_schema(&conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), Some(SCHEMA_VERSION));
        assert!(!needs_init(&conn));
    }

    #[test]
    fn test_upgrade_from_version_1() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE schema_info (key TEXT PRIMARY KEY, value TEXT NOT NULL);
             INSERT INTO schema_info VALUES ('version', '1');
             CREATE TABLE changes (
                 seq INTEGER PRIMARY KEY,
                 doc_id TEXT NOT NULL,
                 generation INTEGER NOT NULL,
                 hash TEXT NOT NULL,
                 deleted INTEGER NOT NULL DEFAULT 0,
                 committed_at INTEGER NOT NULL
             );
             INSERT INTO changes VALUES (1, 'e1', 1, 'ab', 0, 0);",
        )
        .unwrap();
        assert!(needs_init(&conn));

        init_schema(&conn).unwrap();

        assert!(has_column(&conn, "changes", "origin").unwrap());
        assert_eq!(get_schema_version(&conn).unwrap(), Some(SCHEMA_VERSION));
        let origin: Option<String> = conn
            .query_row("SELECT origin FROM changes WHERE seq = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(origin, None);
    }

    #[test]
    fn test_init_is_idempotent_and_keeps_sequence() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn.execute("UPDATE meta SET value = 42 WHERE key = 'last_seq'", [])
            .unwrap();

        init_schema(&conn).unwrap();

        let last: i64 = conn
            .query_row("SELECT value FROM meta WHERE key = 'last_seq'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(last, 42);
    }
}
