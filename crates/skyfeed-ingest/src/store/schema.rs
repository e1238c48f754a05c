//! SQLite schema for the feed database.
//!
//! Versioned with a single-row `schema_version` table; fresh databases get
//! the latest tables, older ones are migrated forward in place.

use rusqlite::{Connection, Result};

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema.
///
/// Creates all tables if they don't exist and runs any pending migrations.
pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        migrate(conn, current_version, SCHEMA_VERSION)?;
    }

    Ok(())
}

/// Get the current schema version (0 if not initialized).
fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

/// Create all tables for a fresh database.
fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Feed index
        CREATE TABLE IF NOT EXISTS post (
            uri TEXT PRIMARY KEY,
            cid TEXT NOT NULL,
            indexed_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_post_indexed_at ON post(indexed_at DESC, cid DESC);

        -- Stream checkpoints, one row per subscription
        CREATE TABLE IF NOT EXISTS sub_state (
            service TEXT PRIMARY KEY,
            cursor INTEGER NOT NULL,
            updated_at INTEGER NOT NULL DEFAULT 0
        );
        "#,
    )?;

    Ok(())
}

/// Run migrations from one version to another.
fn migrate(conn: &Connection, from: i32, to: i32) -> Result<()> {
    for version in from..to {
        if version == 1 {
            migrate_v1_to_v2(conn)?;
        }
    }
    set_schema_version(conn, to)?;
    Ok(())
}

/// Migrate from v1 to v2: track when each checkpoint was last written.
fn migrate_v1_to_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        ALTER TABLE sub_state ADD COLUMN updated_at INTEGER NOT NULL DEFAULT 0;
        CREATE INDEX IF NOT EXISTS idx_post_indexed_at ON post(indexed_at DESC, cid DESC);
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn table_names(conn: &Connection) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_init_schema_fresh_db() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables = table_names(&conn);
        assert!(tables.contains(&"post".to_string()));
        assert!(tables.contains(&"sub_state".to_string()));
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_init_schema_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
    }

    #[test]
    fn test_migrate_v1_adds_updated_at() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE post (uri TEXT PRIMARY KEY, cid TEXT NOT NULL, indexed_at TEXT NOT NULL);
            CREATE TABLE sub_state (service TEXT PRIMARY KEY, cursor INTEGER NOT NULL);
            INSERT INTO sub_state (service, cursor) VALUES ('wss://bsky.network', 1234);
            "#,
        )
        .unwrap();
        get_schema_version(&conn).unwrap();
        set_schema_version(&conn, 1).unwrap();

        init_schema(&conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
        let (cursor, updated_at): (i64, i64) = conn
            .query_row(
                "SELECT cursor, updated_at FROM sub_state WHERE service = 'wss://bsky.network'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(cursor, 1234);
        assert_eq!(updated_at, 0);
    }
}
