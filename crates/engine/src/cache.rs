// Local durable cache: per-room CRDT state blobs for instant warm start.
//
// Independent of network availability. The connection manager evicts
// stale rows before loading, so a tab reopened weeks later starts from
// the remote store instead of resurrecting ancient local history.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use noteroom_common::types::RoomId;

const MIGRATION_SQL: &str = "
CREATE TABLE IF NOT EXISTS room_state (
    room_id     TEXT PRIMARY KEY,
    state       BLOB NOT NULL,
    saved_at    TEXT NOT NULL
);
";

/// Sqlite-backed blob store, one row per room.
pub struct LocalCache {
    conn: Connection,
}

impl LocalCache {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create cache parent directory `{}`", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open local cache at `{}`", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("failed to open in-memory local cache")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("failed to configure sqlite pragmas for local cache")?;
        conn.execute_batch(MIGRATION_SQL).context("failed to migrate local cache schema")?;
        Ok(Self { conn })
    }

    /// Read the cached state for a room, if any.
    pub fn load(&self, room: &RoomId) -> Result<Option<Vec<u8>>> {
        self.conn
            .query_row(
                "SELECT state FROM room_state WHERE room_id = ?1",
                params![room.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query cached room state")
    }

    /// Upsert the cached state for a room.
    pub fn store(&self, room: &RoomId, state: &[u8], saved_at: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO room_state (room_id, state, saved_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(room_id) DO UPDATE SET state = ?2, saved_at = ?3",
                params![room.as_str(), state, saved_at.to_rfc3339()],
            )
            .context("failed to store cached room state")?;
        Ok(())
    }

    pub fn remove(&self, room: &RoomId) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM room_state WHERE room_id = ?1", params![room.as_str()])
            .context("failed to remove cached room state")?;
        Ok(changed > 0)
    }

    /// Delete rows older than `max_age`. Returns the number evicted.
    /// Timestamps are RFC 3339 UTC, so string comparison is ordering.
    pub fn evict_stale(&self, max_age: Duration, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = (now - max_age).to_rfc3339();
        let evicted = self
            .conn
            .execute("DELETE FROM room_state WHERE saved_at < ?1", params![cutoff])
            .context("failed to evict stale cache rows")?;
        Ok(evicted)
    }
}
