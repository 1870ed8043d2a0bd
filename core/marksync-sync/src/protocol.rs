//! Wire protocol between device agents and the coordinator.
//!
//! Every frame is a JSON envelope `{ "type": <string>, "data": <object> }`:
//!
//! | type | direction | data |
//! |---|---|---|
//! | `ping` / `pong` | either | `{ timestamp }` |
//! | `sync_event` | either | one `SyncEvent` |
//! | `sync_request` | client -> server | `{ deviceId, lastSequence }` |
//! | `sync_response` | server -> client | `{ events, lastSyncSequence }` |
//! | `event_ack` | server -> client | `{ eventId, sequence }` |
//! | `error` | server -> client | `{ code, message, eventId? }` |
//! | `checkpoint` | client -> server | `{ lastSequence }` |

use crate::error::{SyncError, SyncResult};
use marksync_types::{DeviceId, EventId, SyncEvent};
use serde::{Deserialize, Serialize};

/// Error codes carried by [`ErrorMessage`].
pub mod codes {
    /// The event or request does not match the authenticated identity.
    pub const UNAUTHORIZED: u16 = 401;
    /// Malformed or unexpected message.
    pub const BAD_REQUEST: u16 = 400;
    /// Event store failure; retry later.
    pub const STORE_UNAVAILABLE: u16 = 503;
    /// Deadline exceeded; retry later.
    pub const TIMEOUT: u16 = 504;
    pub const INTERNAL: u16 = 500;
}

/// A sync protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SyncMessage {
    /// Keepalive probe.
    Ping(Heartbeat),
    /// Reply to a ping, echoing its timestamp.
    Pong(Heartbeat),
    /// A change event, submitted by a client or fanned out by the server.
    SyncEvent(SyncEvent),
    /// Delta catch-up request.
    SyncRequest(SyncRequest),
    /// Delta catch-up response.
    SyncResponse(SyncResponse),
    /// An event was persisted.
    EventAck(EventAck),
    /// A request was rejected.
    Error(ErrorMessage),
    /// The client reports the highest sequence it has applied.
    Checkpoint(CheckpointReport),
}

impl SyncMessage {
    /// Creates a ping stamped with the current time.
    pub fn ping() -> Self {
        Self::Ping(Heartbeat::now())
    }

    /// The envelope `type` of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::SyncEvent(_) => "sync_event",
            Self::SyncRequest(_) => "sync_request",
            Self::SyncResponse(_) => "sync_response",
            Self::EventAck(_) => "event_ack",
            Self::Error(_) => "error",
            Self::Checkpoint(_) => "checkpoint",
        }
    }

    /// Serializes to a JSON envelope.
    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a JSON envelope.
    pub fn from_json(text: &str) -> SyncResult<Self> {
        serde_json::from_str(text).map_err(|e| SyncError::Protocol(format!("invalid message: {e}")))
    }
}

/// Payload of `ping` and `pong`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Sender's clock, milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl Heartbeat {
    pub fn now() -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub device_id: DeviceId,
    /// Highest sequence the device has applied.
    pub last_sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    /// Events after the requested sequence, ascending, excluding the
    /// requester's own.
    pub events: Vec<SyncEvent>,
    /// Checkpoint the requester may adopt after applying `events`.
    pub last_sync_sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventAck {
    pub event_id: EventId,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    pub code: u16,
    pub message: String,
    /// The event the error refers to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
}

impl ErrorMessage {
    /// Builds the wire form of an error.
    pub fn from_error(err: &SyncError, event_id: Option<EventId>) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            event_id,
        }
    }

    /// Converts a received error back into a [`SyncError`].
    pub fn into_error(self) -> SyncError {
        if self.code == codes::UNAUTHORIZED {
            SyncError::Unauthorized(self.message)
        } else {
            SyncError::Rejected {
                code: self.code,
                message: self.message,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointReport {
    pub last_sequence: u64,
}
