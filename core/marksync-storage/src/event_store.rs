//! The coordinator-side event log contract.

use crate::StorageResult;
use marksync_types::{DeviceId, SyncEvent, UserId};

/// Result of appending an event to the log.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    /// The event was new and has been assigned the next sequence.
    Appended(SyncEvent),
    /// An event with the same ID was already stored; carries the stored
    /// copy with its original sequence.
    Duplicate(SyncEvent),
}

impl AppendOutcome {
    /// The persisted event, with its sequence set.
    pub fn event(&self) -> &SyncEvent {
        match self {
            Self::Appended(e) | Self::Duplicate(e) => e,
        }
    }

    /// Consumes the outcome, returning the persisted event.
    pub fn into_event(self) -> SyncEvent {
        match self {
            Self::Appended(e) | Self::Duplicate(e) => e,
        }
    }

    /// Whether the event had already been stored.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }

    /// The sequence assigned to the event.
    pub fn sequence(&self) -> u64 {
        self.event().sequence.unwrap_or_default()
    }
}

/// Append-only, per-user log of sync events plus per-device checkpoints.
///
/// Implementations are blocking; async callers should run them on the
/// blocking pool. `append` must serialize sequence assignment per user but
/// must not serialize appends of different users behind one another more
/// than the backing engine requires.
pub trait SyncEventStore: Send + Sync {
    /// Persists an event, assigning it the next sequence for its user.
    ///
    /// Sequences start at 1 and increase by one per appended event. An
    /// event whose ID is already stored is not re-sequenced.
    fn append(&self, event: SyncEvent) -> StorageResult<AppendOutcome>;

    /// Returns all events of `user_id` with `sequence > after`, ascending.
    fn read_since(&self, user_id: &UserId, after: u64) -> StorageResult<Vec<SyncEvent>>;

    /// Highest sequence assigned for `user_id`, or 0 if none.
    fn latest_sequence(&self, user_id: &UserId) -> StorageResult<u64>;

    /// Durable checkpoint of a device, if it has ever reported one.
    fn load_checkpoint(&self, user_id: &UserId, device_id: &DeviceId) -> StorageResult<Option<u64>>;

    /// Records a device checkpoint. Checkpoints never move backwards;
    /// returns the checkpoint in effect after the call.
    fn save_checkpoint(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        sequence: u64,
    ) -> StorageResult<u64>;
}
