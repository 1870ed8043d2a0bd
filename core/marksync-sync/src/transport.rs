//! Client-side transport abstraction.
//!
//! The device agent talks to the coordinator through a [`SyncTransport`]
//! obtained from a [`TransportConnector`]. Implementations:
//!
//! - [`WsConnector`](crate::WsConnector): WebSocket via tokio-tungstenite.
//! - [`LocalConnector`](crate::LocalConnector): attaches directly to an
//!   in-process [`SyncCoordinator`](crate::SyncCoordinator).

use crate::error::SyncResult;
use crate::protocol::SyncMessage;
use async_trait::async_trait;

/// One established connection to the coordinator.
#[async_trait]
pub trait SyncTransport: Send {
    /// Sends a message.
    async fn send(&mut self, message: SyncMessage) -> SyncResult<()>;

    /// Receives the next message. Returns `None` once the connection is
    /// closed. Must be cancel-safe.
    async fn recv(&mut self) -> Option<SyncResult<SyncMessage>>;

    /// Closes the connection.
    async fn close(&mut self) -> SyncResult<()>;
}

/// Opens connections for one device.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    type Transport: SyncTransport + 'static;

    async fn connect(&self) -> SyncResult<Self::Transport>;
}
