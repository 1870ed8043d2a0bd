//! Core type definitions for marksync.
//!
//! This crate defines the fundamental types shared by the server-side
//! coordinator and the device-side agent:
//! - Event, user and device identifiers
//! - Sync events (create / update / delete of an opaque resource)
//! - Per-device sync state
//!
//! Bookmark and collection models live outside the sync core; to this
//! crate a resource is only a `(resource_type, resource_id)` pair.

mod event;
mod ids;
mod state;

pub use event::{EventType, ResourceKey, SyncEvent};
pub use ids::{DeviceId, EventId, UserId};
pub use state::{ConnectionStatus, DeviceSyncState};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid event type: {0}")]
    InvalidEventType(String),
}
