//! Persistence for marksync.
//!
//! Two independent concerns live here:
//!
//! - The **sync event store** used by the coordinator: an append-only,
//!   per-user log that assigns each event its sequence, plus the durable
//!   per-device checkpoints. See [`SyncEventStore`].
//! - The **local store** used by a device agent: its offline queue of
//!   unacknowledged events and its cached checkpoint, both of which must
//!   survive process restarts. See [`LocalStore`].
//!
//! Each has an in-memory implementation for tests and embedding, and a
//! SQLite implementation for real deployments.

mod error;
mod event_store;
mod local_store;
mod memory;
mod sqlite;

pub use error::{StorageError, StorageResult};
pub use event_store::{AppendOutcome, SyncEventStore};
pub use local_store::{LocalStore, MemoryLocalStore, SqliteLocalStore};
pub use memory::MemoryEventStore;
pub use sqlite::SqliteEventStore;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the guard if a previous holder panicked.
/// Store state is only mutated through complete statements, so a poisoned
/// lock never exposes a half-written record.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn to_sql_seq(sequence: u64) -> StorageResult<i64> {
    i64::try_from(sequence)
        .map_err(|_| StorageError::InvalidData(format!("sequence {sequence} out of range")))
}

pub(crate) fn from_sql_seq(value: i64) -> StorageResult<u64> {
    u64::try_from(value)
        .map_err(|_| StorageError::InvalidData(format!("negative sequence {value}")))
}
