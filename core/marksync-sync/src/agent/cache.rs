//! The agent's local view of synced resources.
//!
//! Entries are keyed by [`ResourceKey`]. Remote events are applied in
//! sequence order and deduplicated by sequence, so replaying a delta twice
//! changes nothing. Local edits are applied optimistically and marked
//! pending until the coordinator acknowledges them.

use chrono::{DateTime, Utc};
use marksync_types::{EventId, EventType, ResourceKey, SyncEvent};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// Cached state of one resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Current content: the last snapshot with later diffs merged in.
    pub content: Value,
    /// Sequence of the last confirmed event applied; `None` if the
    /// resource only exists as a pending local edit.
    pub sequence: Option<u64>,
    pub deleted: bool,
    /// The latest local edit that has not been acknowledged yet.
    pub pending: Option<EventId>,
    pub updated_at: DateTime<Utc>,
}

/// Last-write-wins cache keyed by resource.
#[derive(Debug, Default)]
pub struct LocalCache {
    entries: HashMap<ResourceKey, CacheEntry>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of all entries.
    pub fn snapshot(&self) -> HashMap<ResourceKey, CacheEntry> {
        self.entries.clone()
    }

    /// Applies a locally created event ahead of acknowledgement.
    pub fn apply_local(&mut self, event: &SyncEvent) {
        let key = event.resource_key();
        let sequence = self.entries.get(&key).and_then(|e| e.sequence);
        let mut entry = self.merged(&key, event);
        entry.sequence = sequence;
        entry.pending = Some(event.id);
        self.entries.insert(key, entry);
    }

    /// Applies an event received from the coordinator. Returns `false`
    /// without changing anything if the entry already reflects this
    /// sequence or a later one.
    ///
    /// A remote event always beats a pending local edit: the local edit has
    /// no sequence yet, and once acknowledged it is re-applied through
    /// [`confirm_local`](Self::confirm_local) with its own, higher sequence.
    pub fn apply_remote(&mut self, event: &SyncEvent) -> bool {
        let Some(sequence) = event.sequence else {
            return false;
        };
        let key = event.resource_key();
        if self
            .entries
            .get(&key)
            .and_then(|e| e.sequence)
            .is_some_and(|current| current >= sequence)
        {
            return false;
        }

        let mut entry = self.merged(&key, event);
        entry.sequence = Some(sequence);
        entry.pending = None;
        self.entries.insert(key, entry);
        true
    }

    /// Re-applies an acknowledged local event with its assigned sequence.
    /// Returns `false` if a later remote event has already superseded it.
    pub fn confirm_local(&mut self, event: &SyncEvent, sequence: u64) -> bool {
        let key = event.resource_key();
        let current = self.entries.get(&key);
        if current
            .and_then(|e| e.sequence)
            .is_some_and(|seq| seq >= sequence)
        {
            return false;
        }

        // A newer local edit to the same resource stays pending on top.
        if let Some(entry) = current.filter(|e| e.pending.is_some_and(|id| id != event.id)) {
            let mut entry = entry.clone();
            entry.sequence = Some(sequence);
            self.entries.insert(key, entry);
            return true;
        }

        let mut entry = self.merged(&key, event);
        entry.sequence = Some(sequence);
        entry.pending = None;
        self.entries.insert(key, entry);
        true
    }

    /// The entry that results from applying `event` on top of the current
    /// one. `update` diffs that are JSON objects are merged key by key into
    /// object content; anything else replaces it.
    fn merged(&self, key: &ResourceKey, event: &SyncEvent) -> CacheEntry {
        let previous = self.entries.get(key);
        let content = match event.event_type {
            EventType::Delete => Value::Null,
            EventType::Create => event.changes.clone(),
            EventType::Update => match (previous.map(|e| &e.content), &event.changes) {
                (Some(Value::Object(base)), Value::Object(diff)) => {
                    let mut merged = base.clone();
                    for (field, value) in diff {
                        merged.insert(field.clone(), value.clone());
                    }
                    Value::Object(merged)
                }
                _ => event.changes.clone(),
            },
        };
        CacheEntry {
            content,
            sequence: previous.and_then(|e| e.sequence),
            deleted: event.event_type == EventType::Delete,
            pending: previous.and_then(|e| e.pending),
            updated_at: event.timestamp,
        }
    }
}
