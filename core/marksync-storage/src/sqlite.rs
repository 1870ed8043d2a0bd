//! SQLite-backed event store.
//!
//! Events are stored as JSON bodies keyed by `(user_id, sequence)`.
//! Event ids are unique per user, matching the in-memory store.
//! Sequence assignment happens inside an immediate transaction so two
//! writers can never hand out the same sequence.

use crate::event_store::{AppendOutcome, SyncEventStore};
use crate::{from_sql_seq, lock, to_sql_seq, StorageResult};
use marksync_types::{DeviceId, SyncEvent, UserId};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

/// Persistent event store backed by SQLite.
pub struct SqliteEventStore {
    conn: Mutex<Connection>,
}

impl SqliteEventStore {
    /// Opens (or creates) an event store at the given path.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        debug!("opened event store at {}", path.as_ref().display());
        Self::with_connection(conn)
    }

    /// Opens an in-memory event store.
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sync_events (
                user_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                event_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (user_id, sequence),
                UNIQUE (user_id, event_id)
            );

            CREATE TABLE IF NOT EXISTS device_checkpoints (
                user_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                last_sequence INTEGER NOT NULL,
                PRIMARY KEY (user_id, device_id)
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl SyncEventStore for SqliteEventStore {
    fn append(&self, event: SyncEvent) -> StorageResult<AppendOutcome> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT body FROM sync_events WHERE user_id = ?1 AND event_id = ?2",
                params![event.user_id.as_str(), event.id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(body) = existing {
            return Ok(AppendOutcome::Duplicate(serde_json::from_str(&body)?));
        }

        let latest: i64 = tx.query_row(
            "SELECT COALESCE(MAX(sequence), 0) FROM sync_events WHERE user_id = ?1",
            params![event.user_id.as_str()],
            |row| row.get(0),
        )?;
        let sequence = from_sql_seq(latest)? + 1;
        let stored = event.with_sequence(sequence);

        tx.execute(
            "INSERT INTO sync_events (user_id, sequence, event_id, device_id, body)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                stored.user_id.as_str(),
                to_sql_seq(sequence)?,
                stored.id.to_string(),
                stored.device_id.as_str(),
                serde_json::to_string(&stored)?,
            ],
        )?;
        tx.commit()?;

        Ok(AppendOutcome::Appended(stored))
    }

    fn read_since(&self, user_id: &UserId, after: u64) -> StorageResult<Vec<SyncEvent>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT body FROM sync_events
             WHERE user_id = ?1 AND sequence > ?2
             ORDER BY sequence ASC",
        )?;
        let bodies = stmt
            .query_map(params![user_id.as_str(), to_sql_seq(after)?], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;

        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(Into::into))
            .collect()
    }

    fn latest_sequence(&self, user_id: &UserId) -> StorageResult<u64> {
        let conn = lock(&self.conn);
        let latest: i64 = conn.query_row(
            "SELECT COALESCE(MAX(sequence), 0) FROM sync_events WHERE user_id = ?1",
            params![user_id.as_str()],
            |row| row.get(0),
        )?;
        from_sql_seq(latest)
    }

    fn load_checkpoint(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> StorageResult<Option<u64>> {
        let conn = lock(&self.conn);
        let value: Option<i64> = conn
            .query_row(
                "SELECT last_sequence FROM device_checkpoints
                 WHERE user_id = ?1 AND device_id = ?2",
                params![user_id.as_str(), device_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        value.map(from_sql_seq).transpose()
    }

    fn save_checkpoint(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        sequence: u64,
    ) -> StorageResult<u64> {
        let conn = lock(&self.conn);
        conn.execute(
            "INSERT INTO device_checkpoints (user_id, device_id, last_sequence)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id, device_id)
             DO UPDATE SET last_sequence = MAX(last_sequence, excluded.last_sequence)",
            params![user_id.as_str(), device_id.as_str(), to_sql_seq(sequence)?],
        )?;
        let effective: i64 = conn.query_row(
            "SELECT last_sequence FROM device_checkpoints
             WHERE user_id = ?1 AND device_id = ?2",
            params![user_id.as_str(), device_id.as_str()],
            |row| row.get(0),
        )?;
        from_sql_seq(effective)
    }
}
