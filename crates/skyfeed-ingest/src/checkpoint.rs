//! Resumption checkpoints.
//!
//! A [`Cursor`] is an opaque, non-decreasing position within one
//! subscription's stream: a sequence number for the firehose, a microsecond
//! timestamp for Jetstream. A [`CheckpointStore`] persists the last
//! acknowledged cursor per subscription identity.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;

use crate::Result;

/// Position within a subscription's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor(pub u64);

impl Cursor {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for Cursor {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable record of the last acknowledged cursor per subscription.
///
/// Implementations are shared by every running ingestion loop and must be
/// safe under concurrent access.
pub trait CheckpointStore: Send + Sync {
    /// Read the persisted cursor. `None` means the subscription is fresh.
    fn get_cursor(&self, subscription_id: &str) -> Result<Option<Cursor>>;

    /// Upsert the cursor for a subscription.
    ///
    /// Writing the same cursor twice leaves the same stored value as writing
    /// it once. A cursor lower than the stored one does not move it back.
    fn set_cursor(&self, subscription_id: &str, cursor: Cursor) -> Result<()>;
}

/// In-memory checkpoint store.
///
/// Records every write in order, which makes it useful for tests and for
/// running without a database.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    cursors: Mutex<HashMap<String, Cursor>>,
    writes: Mutex<Vec<(String, Cursor)>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with an existing checkpoint.
    pub fn with_cursor(subscription_id: &str, cursor: Cursor) -> Self {
        let store = Self::default();
        store
            .cursors
            .lock()
            .insert(subscription_id.to_string(), cursor);
        store
    }

    /// All `set_cursor` calls in the order they were made.
    pub fn writes(&self) -> Vec<(String, Cursor)> {
        self.writes.lock().clone()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get_cursor(&self, subscription_id: &str) -> Result<Option<Cursor>> {
        Ok(self.cursors.lock().get(subscription_id).copied())
    }

    fn set_cursor(&self, subscription_id: &str, cursor: Cursor) -> Result<()> {
        self.writes
            .lock()
            .push((subscription_id.to_string(), cursor));

        let mut cursors = self.cursors.lock();
        let entry = cursors.entry(subscription_id.to_string()).or_insert(cursor);
        *entry = (*entry).max(cursor);
        Ok(())
    }
}
