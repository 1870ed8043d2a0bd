//! Error types for the sync layer.

use marksync_storage::StorageError;
use marksync_types::{DeviceId, UserId};
use std::time::Duration;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The event or request does not belong to the authenticated
    /// user/device. Fatal to the session.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The event store failed; the event was not persisted and must be
    /// retried.
    #[error("event store unavailable: {0}")]
    StoreUnavailable(String),

    /// A newer connection for the same device evicted this session.
    #[error("session for {user}/{device} replaced by a newer connection")]
    DuplicateSession { user: UserId, device: DeviceId },

    /// No heartbeat traffic within the timeout.
    #[error("no heartbeat for {0:?}")]
    ConnectionTimeout(Duration),

    /// An ingest or delta request exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The server rejected a request.
    #[error("rejected by server ({code}): {message}")]
    Rejected { code: u16, message: String },

    /// The agent gave up reconnecting.
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// There is no live connection.
    #[error("not connected")]
    NotConnected,

    /// Network error.
    #[error("network error: {0}")]
    Network(String),

    /// Protocol error (invalid or unexpected message).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,

    /// Local storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl SyncError {
    /// Whether retrying later (after a reconnect or backoff) may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::StoreUnavailable(_)
            | Self::ConnectionTimeout(_)
            | Self::Timeout
            | Self::NotConnected
            | Self::Network(_)
            | Self::ChannelClosed => true,
            Self::Rejected { code, .. } => *code >= 500,
            _ => false,
        }
    }

    /// Wire error code for this error, as sent in `error` messages.
    pub fn code(&self) -> u16 {
        match self {
            Self::Unauthorized(_) => crate::protocol::codes::UNAUTHORIZED,
            Self::Protocol(_) | Self::Serialization(_) => crate::protocol::codes::BAD_REQUEST,
            Self::StoreUnavailable(_) | Self::Storage(_) => {
                crate::protocol::codes::STORE_UNAVAILABLE
            }
            Self::Timeout => crate::protocol::codes::TIMEOUT,
            Self::Rejected { code, .. } => *code,
            _ => crate::protocol::codes::INTERNAL,
        }
    }
}
