//! Device-local durable state: the offline queue and the cached checkpoint.

use crate::{from_sql_seq, lock, to_sql_seq, StorageResult};
use marksync_types::{EventId, SyncEvent};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// Durable storage for a device agent.
///
/// The queue holds events that have not been acknowledged by the
/// coordinator, in the order they were created. It is the single source of
/// truth for what still needs sending: an event leaves it only after an
/// acknowledgement.
pub trait LocalStore: Send + Sync {
    /// Loads the queued events, oldest first.
    fn load_queue(&self) -> StorageResult<Vec<SyncEvent>>;

    /// Appends an event to the back of the queue. Re-queueing an event
    /// that is already queued keeps its original position.
    fn enqueue(&self, event: &SyncEvent) -> StorageResult<()>;

    /// Removes an acknowledged event. Returns whether it was queued.
    fn remove(&self, event_id: &EventId) -> StorageResult<bool>;

    /// Loads the cached checkpoint (0 if the device never synced).
    fn load_checkpoint(&self) -> StorageResult<u64>;

    /// Persists the cached checkpoint.
    fn save_checkpoint(&self, sequence: u64) -> StorageResult<()>;
}

/// Local store that lives only as long as the process.
#[derive(Default)]
pub struct MemoryLocalStore {
    queue: Mutex<Vec<SyncEvent>>,
    checkpoint: Mutex<u64>,
}

impl MemoryLocalStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryLocalStore {
    fn load_queue(&self) -> StorageResult<Vec<SyncEvent>> {
        Ok(lock(&self.queue).clone())
    }

    fn enqueue(&self, event: &SyncEvent) -> StorageResult<()> {
        let mut queue = lock(&self.queue);
        if !queue.iter().any(|e| e.id == event.id) {
            queue.push(event.clone());
        }
        Ok(())
    }

    fn remove(&self, event_id: &EventId) -> StorageResult<bool> {
        let mut queue = lock(&self.queue);
        let before = queue.len();
        queue.retain(|e| e.id != *event_id);
        Ok(queue.len() != before)
    }

    fn load_checkpoint(&self) -> StorageResult<u64> {
        Ok(*lock(&self.checkpoint))
    }

    fn save_checkpoint(&self, sequence: u64) -> StorageResult<()> {
        *lock(&self.checkpoint) = sequence;
        Ok(())
    }
}

/// Local store persisted in a SQLite file, surviving restarts.
pub struct SqliteLocalStore {
    conn: Mutex<Connection>,
}

const CHECKPOINT_KEY: &str = "last_sync_sequence";

impl SqliteLocalStore {
    /// Opens (or creates) a local store at the given path.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Opens an in-memory local store.
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS offline_queue (
                position INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL UNIQUE,
                body TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agent_meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl LocalStore for SqliteLocalStore {
    fn load_queue(&self) -> StorageResult<Vec<SyncEvent>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare("SELECT body FROM offline_queue ORDER BY position ASC")?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(Into::into))
            .collect()
    }

    fn enqueue(&self, event: &SyncEvent) -> StorageResult<()> {
        let conn = lock(&self.conn);
        conn.execute(
            "INSERT OR IGNORE INTO offline_queue (event_id, body) VALUES (?1, ?2)",
            params![event.id.to_string(), serde_json::to_string(event)?],
        )?;
        Ok(())
    }

    fn remove(&self, event_id: &EventId) -> StorageResult<bool> {
        let conn = lock(&self.conn);
        let removed = conn.execute(
            "DELETE FROM offline_queue WHERE event_id = ?1",
            params![event_id.to_string()],
        )?;
        Ok(removed > 0)
    }

    fn load_checkpoint(&self) -> StorageResult<u64> {
        let conn = lock(&self.conn);
        let value: Option<i64> = conn
            .query_row(
                "SELECT value FROM agent_meta WHERE key = ?1",
                params![CHECKPOINT_KEY],
                |row| row.get(0),
            )
            .optional()?;
        value.map_or(Ok(0), from_sql_seq)
    }

    fn save_checkpoint(&self, sequence: u64) -> StorageResult<()> {
        let conn = lock(&self.conn);
        conn.execute(
            "INSERT INTO agent_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![CHECKPOINT_KEY, to_sql_seq(sequence)?],
        )?;
        Ok(())
    }
}
