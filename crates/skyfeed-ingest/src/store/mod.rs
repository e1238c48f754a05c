//! SQLite persistence for the feed index and stream checkpoints.
//!
//! The [`Database`] is shared by every ingestion loop, the feed handler and
//! the manual override poller. A single connection guarded by a mutex keeps
//! writes serialized.

pub mod schema;

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};

use crate::checkpoint::{CheckpointStore, Cursor};
use crate::{Error, Result};

/// A stored feed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRow {
    pub uri: String,
    pub cid: String,
    pub indexed_at: String,
}

/// A persisted checkpoint, for introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRow {
    pub service: String,
    pub cursor: u64,
    pub updated_at: i64,
}

/// Feed database.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::Database(format!("Failed to open SQLite: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| Error::Database(format!("Failed to set PRAGMA: {}", e)))?;

        schema::init_schema(&conn)
            .map_err(|e| Error::Database(format!("Failed to init schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("Failed to open in-memory SQLite: {}", e)))?;

        schema::init_schema(&conn)
            .map_err(|e| Error::Database(format!("Failed to init schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert posts, ignoring URIs that are already indexed.
    ///
    /// Returns the number of rows actually inserted.
    pub fn insert_posts(&self, posts: &[PostRow]) -> Result<usize> {
        if posts.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO post (uri, cid, indexed_at) VALUES (?, ?, ?)
                 ON CONFLICT(uri) DO NOTHING",
            )?;
            for post in posts {
                inserted += stmt.execute(rusqlite::params![post.uri, post.cid, post.indexed_at])?;
            }
        }
        tx.commit()?;

        Ok(inserted)
    }

    /// Delete posts by URI. Unknown URIs are ignored.
    ///
    /// Returns the number of rows removed.
    pub fn delete_posts(&self, uris: &[String]) -> Result<usize> {
        if uris.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM post WHERE uri = ?")?;
            for uri in uris {
                deleted += stmt.execute([uri])?;
            }
        }
        tx.commit()?;

        Ok(deleted)
    }

    pub fn get_post(&self, uri: &str) -> Result<Option<PostRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT uri, cid, indexed_at FROM post WHERE uri = ?",
                [uri],
                |row| {
                    Ok(PostRow {
                        uri: row.get(0)?,
                        cid: row.get(1)?,
                        indexed_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn post_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM post", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Get all checkpoints (for debugging/introspection).
    pub fn get_checkpoints(&self) -> Result<Vec<CheckpointRow>> {
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare("SELECT service, cursor, updated_at FROM sub_state ORDER BY service")
            .map_err(|e| Error::Database(e.to_string()))?;

        let rows = stmt
            .query_map([], |row| {
                Ok(CheckpointRow {
                    service: row.get(0)?,
                    cursor: row.get::<_, i64>(1)? as u64,
                    updated_at: row.get(2)?,
                })
            })
            .map_err(|e| Error::Database(e.to_string()))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    fn unix_now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

impl CheckpointStore for Database {
    fn get_cursor(&self, subscription_id: &str) -> Result<Option<Cursor>> {
        let conn = self.conn.lock();
        let cursor: Option<i64> = conn
            .query_row(
                "SELECT cursor FROM sub_state WHERE service = ?",
                [subscription_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Database(format!("Failed to read checkpoint: {}", e)))?;

        Ok(cursor.map(|v| Cursor(v as u64)))
    }

    fn set_cursor(&self, subscription_id: &str, cursor: Cursor) -> Result<()> {
        let now = Self::unix_now();
        let conn = self.conn.lock();

        conn.execute(
            "INSERT INTO sub_state (service, cursor, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(service) DO UPDATE SET
                cursor = MAX(cursor, excluded.cursor),
                updated_at = excluded.updated_at",
            rusqlite::params![subscription_id, cursor.value() as i64, now],
        )
        .map_err(|e| Error::Database(format!("Failed to update checkpoint: {}", e)))?;

        Ok(())
    }
}
