//! Live device connections.
//!
//! Each connected device has one [`Session`], moving through
//! `Connecting -> Open -> Closing -> Closed`. The [`SessionRegistry`]
//! indexes open sessions by `(user, device)` so fan-out can find a user's
//! peers without serializing behind other users.
//!
//! A session never owns the socket. The connection loop that does (the
//! server's WebSocket handler, or the in-process bridge) holds the
//! receiving half of the outbound channel and watches the close signal.

use crate::lock;
use crate::protocol::SyncMessage;
use dashmap::DashMap;
use marksync_types::{DeviceId, UserId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Process-unique session identifier.
pub type SessionId = u64;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Why a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The device disconnected.
    ClientDisconnect,
    /// No inbound traffic within the heartbeat timeout.
    HeartbeatTimeout,
    /// A newer connection for the same device took over.
    Replaced,
    /// The device sent data for an identity it does not own.
    Unauthorized,
    /// The coordinator is shutting down.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ClientDisconnect => "client disconnect",
            Self::HeartbeatTimeout => "heartbeat timeout",
            Self::Replaced => "replaced by newer connection",
            Self::Unauthorized => "unauthorized",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// One live device connection.
pub struct Session {
    id: SessionId,
    user_id: UserId,
    device_id: DeviceId,
    state: Mutex<SessionState>,
    outbound: mpsc::Sender<SyncMessage>,
    closed: watch::Sender<Option<CloseReason>>,
    last_seen: Mutex<Instant>,
    checkpoint: AtomicU64,
}

/// The connection loop's side of a session: messages to write to the
/// device and the close signal.
pub struct SessionLink {
    pub session: Arc<Session>,
    /// Fan-out and heartbeat messages queued for this device.
    pub outbound: mpsc::Receiver<SyncMessage>,
    pub closed: CloseSignal,
    /// Whether this connection evicted an older one for the same device.
    pub replaced: bool,
}

/// Fires when the coordinator closes a session.
pub struct CloseSignal(watch::Receiver<Option<CloseReason>>);

impl CloseSignal {
    /// Resolves once the session is closing. Cancel-safe.
    pub async fn wait(&mut self) -> CloseReason {
        match self.0.wait_for(Option::is_some).await {
            Ok(reason) => reason.unwrap_or(CloseReason::Shutdown),
            Err(_) => CloseReason::Shutdown,
        }
    }
}

impl Session {
    /// Creates a session in `Connecting` state, together with the link
    /// for its connection loop.
    pub(crate) fn new(
        id: SessionId,
        user_id: UserId,
        device_id: DeviceId,
        outbound_buffer: usize,
        checkpoint: u64,
    ) -> (Arc<Self>, SessionLink) {
        let (outbound, outbound_rx) = mpsc::channel(outbound_buffer.max(1));
        let (closed, closed_rx) = watch::channel(None);
        let session = Arc::new(Self {
            id,
            user_id,
            device_id,
            state: Mutex::new(SessionState::Connecting),
            outbound,
            closed,
            last_seen: Mutex::new(Instant::now()),
            checkpoint: AtomicU64::new(checkpoint),
        });
        let link = SessionLink {
            session: session.clone(),
            outbound: outbound_rx,
            closed: CloseSignal(closed_rx),
            replaced: false,
        };
        (session, link)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// `Connecting -> Open`. Returns `false` in any other state.
    pub(crate) fn open(&self) -> bool {
        let mut state = lock(&self.state);
        if *state != SessionState::Connecting {
            return false;
        }
        *state = SessionState::Open;
        true
    }

    /// Moves to `Closing` and signals the connection loop. Returns `false`
    /// if the session was already closing or closed.
    pub(crate) fn begin_close(&self, reason: CloseReason) -> bool {
        {
            let mut state = lock(&self.state);
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return false;
            }
            *state = SessionState::Closing;
        }
        self.closed.send_replace(Some(reason));
        true
    }

    pub(crate) fn finish_close(&self) {
        *lock(&self.state) = SessionState::Closed;
    }

    /// Queues a message for the device without waiting.
    pub fn try_send(
        &self,
        message: SyncMessage,
    ) -> Result<(), mpsc::error::TrySendError<SyncMessage>> {
        self.outbound.try_send(message)
    }

    /// Records inbound traffic.
    pub fn touch(&self) {
        *lock(&self.last_seen) = Instant::now();
    }

    /// Time since the last inbound traffic.
    pub fn idle_for(&self) -> Duration {
        lock(&self.last_seen).elapsed()
    }

    /// Highest sequence the device has reported applying.
    pub fn checkpoint(&self) -> u64 {
        self.checkpoint.load(Ordering::Acquire)
    }

    /// Raises the reported checkpoint; never lowers it.
    pub fn report_checkpoint(&self, sequence: u64) -> u64 {
        self.checkpoint.fetch_max(sequence, Ordering::AcqRel).max(sequence)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Concurrent index of live sessions, sharded by user.
#[derive(Default)]
pub struct SessionRegistry {
    users: DashMap<UserId, HashMap<DeviceId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session, returning the one it displaced for the same
    /// `(user, device)`, if any.
    pub fn register(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.users
            .entry(session.user_id.clone())
            .or_default()
            .insert(session.device_id.clone(), session)
    }

    /// Looks up the live session of a device.
    pub fn lookup(&self, user_id: &UserId, device_id: &DeviceId) -> Option<Arc<Session>> {
        self.users.get(user_id)?.get(device_id).cloned()
    }

    /// Removes `session` if it is still the registered one for its device.
    /// A session that has already been replaced leaves its successor alone.
    pub fn remove(&self, session: &Session) -> bool {
        let removed = match self.users.get_mut(&session.user_id) {
            Some(mut devices) => {
                let current = devices
                    .get(&session.device_id)
                    .is_some_and(|s| s.id == session.id);
                if current {
                    devices.remove(&session.device_id);
                }
                current
            }
            None => false,
        };
        if removed {
            self.users.remove_if(&session.user_id, |_, devices| devices.is_empty());
        }
        removed
    }

    /// Snapshot of a user's sessions other than `exclude`, for fan-out.
    pub fn peers_of(&self, user_id: &UserId, exclude: &DeviceId) -> Vec<Arc<Session>> {
        self.users
            .get(user_id)
            .map(|devices| {
                devices
                    .iter()
                    .filter(|(device, _)| *device != exclude)
                    .map(|(_, session)| session.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot of every registered session.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.users
            .iter()
            .flat_map(|entry| entry.value().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.users.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
