//! Sync coordinator and device agent for marksync.
//!
//! # Architecture
//!
//! Devices never talk to each other. Every change goes through the
//! coordinator, which persists it, assigns it the user's next sequence and
//! pushes it to the user's other connected devices.
//!
//! ## Components
//!
//! - **Protocol**: JSON messages exchanged over a connection
//! - **Session**: one live device connection, and the registry of them
//! - **Coordinator**: ingest, fan-out, delta catch-up, heartbeats
//! - **Transport**: abstracts the connection (WebSocket, in-process)
//! - **Agent**: the device side: offline queue, checkpoint, reconnects
//!
//! ## Sync Process
//!
//! 1. **Connect**: the device opens a session (replacing any older one)
//! 2. **Catch up**: `sync_request` from its checkpoint, apply the delta
//! 3. **Flush**: send queued offline events in order, one ack each
//! 4. **Live**: receive peers' events as they are persisted
//!
//! # Example
//!
//! ```
//! use marksync_storage::{MemoryEventStore, MemoryLocalStore};
//! use marksync_sync::{AgentConfig, CoordinatorConfig, LocalConnector, SyncAgent, SyncCoordinator};
//! use marksync_types::{DeviceId, UserId};
//! use std::sync::Arc;
//!
//! let coordinator = Arc::new(SyncCoordinator::new(
//!     CoordinatorConfig::default(),
//!     Arc::new(MemoryEventStore::new()),
//! ));
//! let user = UserId::new("user-1");
//! let device = DeviceId::new("laptop");
//! let connector = LocalConnector::new(coordinator, user.clone(), device.clone());
//! let agent = SyncAgent::new(
//!     user,
//!     device,
//!     AgentConfig::default(),
//!     connector,
//!     Arc::new(MemoryLocalStore::new()),
//! )
//! .unwrap();
//! assert_eq!(agent.checkpoint(), 0);
//! ```

pub mod agent;
mod coordinator;
mod error;
mod local;
pub mod protocol;
mod rest;
pub mod session;
pub mod transport;
mod ws;

pub use agent::{AgentConfig, AgentEvent, CacheEntry, LocalCache, ReconnectPolicy, SyncAgent};
pub use coordinator::{
    CoordinatorConfig, HeartbeatConfig, JobPlanner, SideEffects, SyncCoordinator,
};
pub use error::{SyncError, SyncResult};
pub use local::{LocalConnector, LocalTransport};
pub use protocol::{
    CheckpointReport, ErrorMessage, EventAck, Heartbeat, SyncMessage, SyncRequest, SyncResponse,
};
pub use rest::{DEVICE_ID_HEADER, RestClient};
pub use session::{CloseReason, Session, SessionLink, SessionState};
pub use transport::{SyncTransport, TransportConnector};
pub use ws::{WsConnector, WsTransport};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
