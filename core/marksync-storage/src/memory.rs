//! In-memory event store.

use crate::event_store::{AppendOutcome, SyncEventStore};
use crate::{lock, StorageResult};
use marksync_types::{DeviceId, EventId, SyncEvent, UserId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

#[derive(Default)]
struct UserLog {
    events: Vec<SyncEvent>,
    by_id: HashMap<EventId, usize>,
}

impl UserLog {
    fn next_sequence(&self) -> u64 {
        self.events.last().and_then(|e| e.sequence).unwrap_or(0) + 1
    }
}

/// Event store held entirely in memory.
///
/// Each user's log sits behind its own lock, so appends for different
/// users never wait on each other; only the outer map is briefly locked
/// the first time a user is seen.
#[derive(Default)]
pub struct MemoryEventStore {
    logs: RwLock<HashMap<UserId, Arc<Mutex<UserLog>>>>,
    checkpoints: Mutex<HashMap<(UserId, DeviceId), u64>>,
}

impl MemoryEventStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn existing_log(&self, user_id: &UserId) -> Option<Arc<Mutex<UserLog>>> {
        self.logs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(user_id)
            .cloned()
    }

    fn log_for(&self, user_id: &UserId) -> Arc<Mutex<UserLog>> {
        if let Some(log) = self.existing_log(user_id) {
            return log;
        }
        self.logs
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(user_id.clone())
            .or_default()
            .clone()
    }

    /// Total number of events across all users.
    pub fn len(&self) -> usize {
        self.logs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .map(|log| lock(log).events.len())
            .sum()
    }

    /// Number of users with at least one stored event.
    pub fn user_count(&self) -> usize {
        self.logs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether no events have been stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SyncEventStore for MemoryEventStore {
    fn append(&self, event: SyncEvent) -> StorageResult<AppendOutcome> {
        let log = self.log_for(&event.user_id);
        let mut log = lock(&log);

        if let Some(&idx) = log.by_id.get(&event.id) {
            return Ok(AppendOutcome::Duplicate(log.events[idx].clone()));
        }

        let sequence = log.next_sequence();
        let stored = event.with_sequence(sequence);
        let idx = log.events.len();
        log.by_id.insert(stored.id, idx);
        log.events.push(stored.clone());
        Ok(AppendOutcome::Appended(stored))
    }

    fn read_since(&self, user_id: &UserId, after: u64) -> StorageResult<Vec<SyncEvent>> {
        let Some(log) = self.existing_log(user_id) else {
            return Ok(Vec::new());
        };
        let log = lock(&log);
        let start = log
            .events
            .partition_point(|e| e.sequence.unwrap_or(0) <= after);
        Ok(log.events[start..].to_vec())
    }

    fn latest_sequence(&self, user_id: &UserId) -> StorageResult<u64> {
        Ok(self
            .existing_log(user_id)
            .map_or(0, |log| lock(&log).next_sequence() - 1))
    }

    fn load_checkpoint(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> StorageResult<Option<u64>> {
        Ok(lock(&self.checkpoints)
            .get(&(user_id.clone(), device_id.clone()))
            .copied())
    }

    fn save_checkpoint(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        sequence: u64,
    ) -> StorageResult<u64> {
        let mut checkpoints = lock(&self.checkpoints);
        let entry = checkpoints
            .entry((user_id.clone(), device_id.clone()))
            .or_insert(0);
        *entry = (*entry).max(sequence);
        Ok(*entry)
    }
}
