//! The server-side sync hub.
//!
//! [`SyncCoordinator`] accepts device sessions, persists inbound events
//! through the [`SyncEventStore`], fans them out to the user's other live
//! sessions and answers delta catch-up requests. It is transport-agnostic:
//! connection loops call [`SyncCoordinator::accept`] once and then feed
//! every inbound message to [`SyncCoordinator::handle_message`].

use crate::error::{SyncError, SyncResult};
use crate::protocol::{ErrorMessage, EventAck, SyncMessage, SyncRequest, SyncResponse};
use crate::session::{CloseReason, Session, SessionId, SessionLink, SessionRegistry};
use marksync_jobs::{Dispatcher, Job, JobError};
use marksync_storage::{AppendOutcome, StorageResult, SyncEventStore};
use marksync_types::{ConnectionStatus, DeviceId, DeviceSyncState, SyncEvent, UserId};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Heartbeat settings for live sessions.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// How often the monitor pings sessions and checks for silence.
    pub interval: Duration,
    /// Sessions silent for longer than this are closed.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Configuration for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Deadline for a single store operation (ingest, delta read).
    pub op_timeout: Duration,
    /// Capacity of each session's outbound buffer.
    pub outbound_buffer: usize,
    pub heartbeat: HeartbeatConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_secs(10),
            outbound_buffer: 256,
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

/// Decides which background jobs an ingested event triggers.
pub trait JobPlanner: Send + Sync {
    fn jobs_for(&self, event: &SyncEvent) -> Vec<Job>;
}

/// Background work triggered by ingested events.
#[derive(Clone)]
pub struct SideEffects {
    pub dispatcher: Arc<Dispatcher>,
    pub planner: Arc<dyn JobPlanner>,
}

/// Server-side sync hub.
pub struct SyncCoordinator {
    config: CoordinatorConfig,
    store: Arc<dyn SyncEventStore>,
    registry: SessionRegistry,
    side_effects: Option<SideEffects>,
    next_session_id: AtomicU64,
}

impl SyncCoordinator {
    pub fn new(config: CoordinatorConfig, store: Arc<dyn SyncEventStore>) -> Self {
        Self {
            config,
            store,
            registry: SessionRegistry::new(),
            side_effects: None,
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Hands ingested events to a job dispatcher.
    #[must_use]
    pub fn with_side_effects(mut self, side_effects: SideEffects) -> Self {
        self.side_effects = Some(side_effects);
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Registers a new session for an authenticated device.
    ///
    /// A live session for the same `(user, device)` is closed and replaced;
    /// that is reported through [`SessionLink::replaced`], never as an
    /// error to the new connection.
    pub async fn accept(&self, user_id: UserId, device_id: DeviceId) -> SyncResult<SessionLink> {
        if user_id.is_empty() || device_id.is_empty() {
            return Err(SyncError::Unauthorized("missing user or device identity".into()));
        }

        let checkpoint = {
            let (user, device) = (user_id.clone(), device_id.clone());
            self.with_store("load_checkpoint", move |store| store.load_checkpoint(&user, &device))
                .await
                .unwrap_or_else(|e| {
                    warn!(
                        user = %user_id,
                        device = %device_id,
                        error = %e,
                        "could not load checkpoint"
                    );
                    None
                })
                .unwrap_or(0)
        };

        let id: SessionId = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (session, mut link) = Session::new(
            id,
            user_id.clone(),
            device_id.clone(),
            self.config.outbound_buffer,
            checkpoint,
        );

        if let Some(previous) = self.registry.register(session.clone()) {
            let notice = SyncError::DuplicateSession {
                user: user_id.clone(),
                device: device_id.clone(),
            };
            info!(session = previous.id(), replacement = id, "{notice}");
            self.close_session(&previous, CloseReason::Replaced).await;
            link.replaced = true;
        }

        session.open();
        info!(session = id, user = %user_id, device = %device_id, checkpoint, "session accepted");
        Ok(link)
    }

    /// Validates, persists and fans out one event.
    ///
    /// Fan-out is non-blocking and happens before this returns, so the
    /// sender's acknowledgement never waits on slow peers. Re-ingesting an
    /// already persisted event returns its original sequence and fans out
    /// nothing.
    pub async fn ingest(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        mut event: SyncEvent,
    ) -> SyncResult<AppendOutcome> {
        if &event.user_id != user_id || &event.device_id != device_id {
            warn!(
                user = %user_id,
                device = %device_id,
                event_user = %event.user_id,
                event_device = %event.device_id,
                "event identity mismatch"
            );
            return Err(SyncError::Unauthorized(format!(
                "event {} does not belong to {user_id}/{device_id}",
                event.id
            )));
        }

        // Sequences are assigned here, never by clients.
        event.sequence = None;
        let outcome = self.with_store("append", move |store| store.append(event)).await?;

        if outcome.is_duplicate() {
            debug!(
                event = %outcome.event().id,
                sequence = outcome.sequence(),
                "duplicate event, not fanned out"
            );
            return Ok(outcome);
        }

        let stored = outcome.event();
        let delivered = self.fan_out(stored);
        debug!(
            event = %stored.id,
            user = %user_id,
            sequence = outcome.sequence(),
            delivered,
            "event ingested"
        );
        self.submit_side_effects(stored);
        Ok(outcome)
    }

    /// Events of `user_id` after `after`, ascending, without those that
    /// originated on `device_id`.
    ///
    /// `last_sync_sequence` covers the caller's own events too, so the
    /// caller may adopt it as its checkpoint.
    pub async fn delta_since(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        after: u64,
    ) -> SyncResult<SyncResponse> {
        let user = user_id.clone();
        let events = self
            .with_store("read_since", move |store| store.read_since(&user, after))
            .await?;

        let last_sync_sequence = events
            .last()
            .and_then(|e| e.sequence)
            .map_or(after, |seq| seq.max(after));
        let events: Vec<SyncEvent> = events
            .into_iter()
            .filter(|e| &e.device_id != device_id)
            .collect();

        debug!(
            user = %user_id,
            device = %device_id,
            after,
            count = events.len(),
            last_sync_sequence,
            "delta computed"
        );
        Ok(SyncResponse {
            events,
            last_sync_sequence,
        })
    }

    /// Pushes a persisted event to every other live session of its user.
    /// Returns the number of sessions it was queued for.
    pub fn fan_out(&self, event: &SyncEvent) -> usize {
        let mut delivered = 0;
        for peer in self.registry.peers_of(&event.user_id, &event.device_id) {
            if !peer.is_open() {
                continue;
            }
            match peer.try_send(SyncMessage::SyncEvent(event.clone())) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => warn!(
                    session = peer.id(),
                    device = %peer.device_id(),
                    event = %event.id,
                    "outbound buffer full, device will catch up by delta"
                ),
                Err(TrySendError::Closed(_)) => warn!(
                    session = peer.id(),
                    device = %peer.device_id(),
                    event = %event.id,
                    "outbound channel closed, skipping fan-out"
                ),
            }
        }
        delivered
    }

    /// Handles one inbound message of a session and returns the replies to
    /// write back, in order.
    ///
    /// Per-message failures become `error` replies. An identity mismatch
    /// also closes the session.
    pub async fn handle_message(
        &self,
        session: &Arc<Session>,
        message: SyncMessage,
    ) -> Vec<SyncMessage> {
        session.touch();
        match message {
            SyncMessage::Ping(heartbeat) => vec![SyncMessage::Pong(heartbeat)],
            SyncMessage::Pong(_) => Vec::new(),
            SyncMessage::SyncEvent(event) => {
                let event_id = event.id;
                match self.ingest(session.user_id(), session.device_id(), event).await {
                    Ok(outcome) => vec![SyncMessage::EventAck(EventAck {
                        event_id,
                        sequence: outcome.sequence(),
                    })],
                    Err(err) => self.reject(session, &err, Some(event_id)).await,
                }
            }
            SyncMessage::SyncRequest(request) => self.handle_sync_request(session, request).await,
            SyncMessage::Checkpoint(report) => {
                self.record_checkpoint(session, report.last_sequence).await;
                Vec::new()
            }
            other @ (SyncMessage::SyncResponse(_)
            | SyncMessage::EventAck(_)
            | SyncMessage::Error(_)) => {
                let err = SyncError::Protocol(format!("unexpected '{}' from client", other.kind()));
                self.reject(session, &err, None).await
            }
        }
    }

    async fn handle_sync_request(
        &self,
        session: &Arc<Session>,
        request: SyncRequest,
    ) -> Vec<SyncMessage> {
        if &request.device_id != session.device_id() {
            let err = SyncError::Unauthorized(format!(
                "sync request for device {} on session of {}",
                request.device_id,
                session.device_id()
            ));
            return self.reject(session, &err, None).await;
        }

        self.record_checkpoint(session, request.last_sequence).await;
        match self
            .delta_since(session.user_id(), session.device_id(), request.last_sequence)
            .await
        {
            Ok(response) => vec![SyncMessage::SyncResponse(response)],
            Err(err) => self.reject(session, &err, None).await,
        }
    }

    async fn reject(
        &self,
        session: &Arc<Session>,
        err: &SyncError,
        event_id: Option<marksync_types::EventId>,
    ) -> Vec<SyncMessage> {
        let reply = SyncMessage::Error(ErrorMessage::from_error(err, event_id));
        if matches!(err, SyncError::Unauthorized(_)) {
            self.close_session(session, CloseReason::Unauthorized).await;
        }
        vec![reply]
    }

    /// Records a checkpoint reported by the device, in memory and durably.
    async fn record_checkpoint(&self, session: &Session, sequence: u64) {
        let effective = session.report_checkpoint(sequence);
        if let Err(e) = self
            .persist_checkpoint(session.user_id(), session.device_id(), effective)
            .await
        {
            warn!(
                session = session.id(),
                sequence = effective,
                error = %e,
                "could not persist checkpoint"
            );
        }
    }

    async fn persist_checkpoint(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        sequence: u64,
    ) -> SyncResult<u64> {
        let (user, device) = (user_id.clone(), device_id.clone());
        self.with_store("save_checkpoint", move |store| {
            store.save_checkpoint(&user, &device, sequence)
        })
        .await
    }

    /// Closes a session: releases it from the registry, flushes its
    /// checkpoint and signals its connection loop. Closing an already
    /// closing session is a no-op.
    pub async fn close_session(&self, session: &Arc<Session>, reason: CloseReason) {
        if !session.begin_close(reason) {
            return;
        }
        self.registry.remove(session);

        let checkpoint = session.checkpoint();
        if checkpoint > 0 {
            if let Err(e) = self
                .persist_checkpoint(session.user_id(), session.device_id(), checkpoint)
                .await
            {
                warn!(session = session.id(), error = %e, "could not flush checkpoint on close");
            }
        }

        session.finish_close();
        info!(
            session = session.id(),
            user = %session.user_id(),
            device = %session.device_id(),
            %reason,
            "session closed"
        );
    }

    /// Builds the sync state of a device: durable checkpoint plus whether
    /// it currently has an open session.
    pub async fn device_state(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> SyncResult<DeviceSyncState> {
        let (user, device) = (user_id.clone(), device_id.clone());
        let checkpoint = self
            .with_store("load_checkpoint", move |store| store.load_checkpoint(&user, &device))
            .await?
            .unwrap_or(0);

        let mut state = DeviceSyncState::new(user_id.clone(), device_id.clone());
        state.last_sync_sequence = checkpoint;
        state.connection_status = match self.registry.lookup(user_id, device_id) {
            Some(session) if session.is_open() => ConnectionStatus::Connected,
            Some(_) => ConnectionStatus::Connecting,
            None => ConnectionStatus::Disconnected,
        };
        Ok(state)
    }

    /// Number of registered sessions.
    pub fn live_sessions(&self) -> usize {
        self.registry.len()
    }

    /// One heartbeat pass: closes sessions silent for longer than the
    /// timeout and pings the rest. Returns how many sessions were closed.
    pub async fn heartbeat_sweep(&self) -> usize {
        let timeout = self.config.heartbeat.timeout;
        let mut closed = 0;
        for session in self.registry.sessions() {
            if !session.is_open() {
                continue;
            }
            let idle = session.idle_for();
            if idle > timeout {
                warn!(
                    session = session.id(),
                    device = %session.device_id(),
                    ?idle,
                    "heartbeat timeout"
                );
                self.close_session(&session, CloseReason::HeartbeatTimeout).await;
                closed += 1;
            } else if let Err(TrySendError::Full(_)) = session.try_send(SyncMessage::ping()) {
                debug!(session = session.id(), "outbound buffer full, skipping ping");
            }
        }
        closed
    }

    /// Runs [`heartbeat_sweep`](Self::heartbeat_sweep) every heartbeat
    /// interval until the task is aborted.
    pub fn spawn_heartbeat_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let period = coordinator.config.heartbeat.interval;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                coordinator.heartbeat_sweep().await;
            }
        })
    }

    /// Closes every session.
    pub async fn shutdown(&self) {
        let sessions = self.registry.sessions();
        info!(sessions = sessions.len(), "closing all sessions");
        for session in sessions {
            self.close_session(&session, CloseReason::Shutdown).await;
        }
    }

    fn submit_side_effects(&self, event: &SyncEvent) {
        let Some(side_effects) = &self.side_effects else {
            return;
        };
        for job in side_effects.planner.jobs_for(event) {
            let kind = job.kind.clone();
            match side_effects.dispatcher.submit(job) {
                Ok(job_id) => debug!(%job_id, %kind, event = %event.id, "side effect queued"),
                Err(JobError::QueueFull) => {
                    warn!(%kind, event = %event.id, "job queue full, side effect dropped");
                }
                Err(e) => warn!(%kind, event = %event.id, error = %e, "side effect not submitted"),
            }
        }
    }

    /// Runs a blocking store operation on the blocking pool, bounded by the
    /// operation timeout.
    async fn with_store<T, F>(&self, op: &'static str, f: F) -> SyncResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SyncEventStore) -> StorageResult<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let task = tokio::task::spawn_blocking(move || f(store.as_ref()));
        match tokio::time::timeout(self.config.op_timeout, task).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => {
                error!(op, error = %e, "event store failure");
                Err(SyncError::StoreUnavailable(e.to_string()))
            }
            Ok(Err(e)) => {
                error!(op, error = %e, "event store task failed");
                Err(SyncError::StoreUnavailable(e.to_string()))
            }
            Err(_) => {
                warn!(op, timeout = ?self.config.op_timeout, "event store operation timed out");
                Err(SyncError::Timeout)
            }
        }
    }
}
