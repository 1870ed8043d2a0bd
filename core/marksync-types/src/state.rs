//! Per-device sync state.

use crate::{DeviceId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection status of a device, as seen by whoever reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// No live connection.
    #[default]
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Live connection established.
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Sync progress of one `(user, device)` pair.
///
/// The coordinator owns the durable checkpoint; a device's copy is a cache
/// of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSyncState {
    pub user_id: UserId,
    pub device_id: DeviceId,
    /// Highest sequence this device has applied.
    pub last_sync_sequence: u64,
    pub connection_status: ConnectionStatus,
}

impl DeviceSyncState {
    /// Creates state for a device that has never synced.
    pub fn new(user_id: UserId, device_id: DeviceId) -> Self {
        Self {
            user_id,
            device_id,
            last_sync_sequence: 0,
            connection_status: ConnectionStatus::Disconnected,
        }
    }

    /// Advances the checkpoint. Returns `false` (and leaves the state
    /// unchanged) if `sequence` would move it backwards.
    pub fn advance_to(&mut self, sequence: u64) -> bool {
        if sequence < self.last_sync_sequence {
            return false;
        }
        self.last_sync_sequence = sequence;
        true
    }
}
