//! The device-side sync agent.
//!
//! A [`SyncAgent`] owns a device's offline queue, its checkpoint and its
//! local cache, and keeps a connection to the coordinator alive:
//!
//! 1. Connect (with exponential backoff between failed attempts).
//! 2. Catch up first: `sync_request` from the last checkpoint, apply the
//!    `sync_response`.
//! 3. Drain the offline queue in creation order, one event at a time. An
//!    event leaves the queue only once it is acknowledged.
//! 4. Stay connected: apply fan-out, answer pings, send heartbeats and a
//!    periodic `sync_request`, send newly queued events.
//!
//! Recording an event never waits for the network: it is persisted to the
//! [`LocalStore`] and queued, and the run loop picks it up.

mod backoff;
mod cache;

pub use backoff::ReconnectPolicy;
pub use cache::{CacheEntry, LocalCache};

use crate::error::{SyncError, SyncResult};
use crate::lock;
use crate::protocol::{
    CheckpointReport, ErrorMessage, EventAck, SyncMessage, SyncRequest, SyncResponse, codes,
};
use crate::transport::{SyncTransport, TransportConnector};
use marksync_storage::LocalStore;
use marksync_types::{
    ConnectionStatus, DeviceId, EventId, EventType, ResourceKey, SyncEvent, UserId,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Configuration for a device agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL of the sync server (`ws://host:port`).
    pub server_url: String,
    /// Deadline for connecting and for each acknowledgement or delta.
    pub op_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Silence after which the connection is considered dead.
    pub heartbeat_timeout: Duration,
    /// How often to re-run delta catch-up while connected.
    pub periodic_sync_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080".to_string(),
            op_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            periodic_sync_interval: Duration::from_secs(300),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Notifications emitted by a running agent.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    StatusChanged(ConnectionStatus),
    /// A remote event changed the local cache.
    RemoteApplied {
        event_id: EventId,
        resource: ResourceKey,
        sequence: u64,
    },
    /// A queued event was acknowledged and removed from the queue.
    Delivered { event_id: EventId, sequence: u64 },
    /// The server rejected a request.
    Rejected {
        event_id: Option<EventId>,
        code: u16,
        message: String,
    },
    /// A reconnect is scheduled. `attempt` is 1-based.
    Reconnecting { attempt: u32, delay: Duration },
    /// The agent stopped trying to reconnect.
    ReconnectExhausted { attempts: u32 },
}

struct AgentState {
    status: ConnectionStatus,
    queue: VecDeque<SyncEvent>,
    cache: LocalCache,
    checkpoint: u64,
}

/// Device-side sync agent.
pub struct SyncAgent<C: TransportConnector> {
    user_id: UserId,
    device_id: DeviceId,
    config: AgentConfig,
    connector: C,
    local: Arc<dyn LocalStore>,
    state: Mutex<AgentState>,
    outgoing: Notify,
    events: broadcast::Sender<AgentEvent>,
    shutdown: watch::Sender<bool>,
}

enum SessionEnd {
    Shutdown,
    Closed,
}

/// What an inbound message turned out to be.
#[derive(Debug)]
enum Reply {
    Ack(EventAck),
    Rejected(ErrorMessage),
    Response,
    Other,
}

struct Connection<T> {
    transport: T,
    last_seen: Instant,
}

impl<C: TransportConnector> SyncAgent<C> {
    /// Creates an agent, restoring its queue and checkpoint from `local`.
    pub fn new(
        user_id: UserId,
        device_id: DeviceId,
        config: AgentConfig,
        connector: C,
        local: Arc<dyn LocalStore>,
    ) -> SyncResult<Self> {
        let queue: VecDeque<SyncEvent> = local.load_queue()?.into();
        let checkpoint = local.load_checkpoint()?;

        let mut cache = LocalCache::new();
        for event in &queue {
            cache.apply_local(event);
        }
        if !queue.is_empty() {
            info!(device = %device_id, queued = queue.len(), checkpoint, "restored offline queue");
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            user_id,
            device_id,
            config,
            connector,
            local,
            state: Mutex::new(AgentState {
                status: ConnectionStatus::Disconnected,
                queue,
                cache,
                checkpoint,
            }),
            outgoing: Notify::new(),
            events,
            shutdown,
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn status(&self) -> ConnectionStatus {
        lock(&self.state).status
    }

    /// Highest sequence known to be applied locally.
    pub fn checkpoint(&self) -> u64 {
        lock(&self.state).checkpoint
    }

    /// Events not yet acknowledged, oldest first.
    pub fn pending_events(&self) -> Vec<SyncEvent> {
        lock(&self.state).queue.iter().cloned().collect()
    }

    /// Cached state of one resource.
    pub fn cached(&self, key: &ResourceKey) -> Option<CacheEntry> {
        lock(&self.state).cache.get(key).cloned()
    }

    /// Snapshot of the whole local cache.
    pub fn cache_snapshot(&self) -> HashMap<ResourceKey, CacheEntry> {
        lock(&self.state).cache.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// Asks [`run`](Self::run) to disconnect and return.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Records a local change and queues it for delivery.
    pub fn record(
        &self,
        event_type: EventType,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        changes: serde_json::Value,
    ) -> SyncResult<SyncEvent> {
        let event = SyncEvent::new(
            self.user_id.clone(),
            self.device_id.clone(),
            event_type,
            resource_type,
            resource_id,
            changes,
        );
        self.enqueue(event.clone())?;
        Ok(event)
    }

    /// Queues an event for delivery. Never waits for the network.
    ///
    /// The event is durably queued before this returns; it is sent as soon
    /// as a connection is available.
    pub fn enqueue(&self, event: SyncEvent) -> SyncResult<()> {
        if event.user_id != self.user_id || event.device_id != self.device_id {
            return Err(SyncError::Unauthorized(format!(
                "event {} belongs to {}/{}, not this device",
                event.id, event.user_id, event.device_id
            )));
        }
        if event.is_persisted() {
            return Err(SyncError::Protocol(format!(
                "event {} already has a sequence",
                event.id
            )));
        }

        self.local.enqueue(&event)?;
        {
            let mut state = lock(&self.state);
            if !state.queue.iter().any(|e| e.id == event.id) {
                state.cache.apply_local(&event);
                debug!(
                    event = %event.id,
                    resource = %event.resource_key(),
                    queued = state.queue.len() + 1,
                    "event queued"
                );
                state.queue.push_back(event);
            }
        }
        self.outgoing.notify_one();
        Ok(())
    }

    /// Runs the connection loop until [`shutdown`](Self::shutdown), an
    /// authorization failure, or reconnect attempts are exhausted.
    pub async fn run(&self) -> SyncResult<()> {
        let mut shutdown = self.shutdown.subscribe();
        let mut attempt = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_status(ConnectionStatus::Connecting);
            let connected = tokio::select! {
                result = tokio::time::timeout(self.config.op_timeout, self.connector.connect()) => {
                    result.unwrap_or(Err(SyncError::Timeout))
                }
                _ = shutdown.wait_for(|stop| *stop) => break,
            };

            match connected {
                Ok(transport) => {
                    attempt = 0;
                    self.set_status(ConnectionStatus::Connected);
                    info!(device = %self.device_id, "connected to sync server");

                    let mut conn = Connection {
                        transport,
                        last_seen: Instant::now(),
                    };
                    let result = self.run_session(&mut conn, &mut shutdown).await;
                    if let Err(e) = conn.transport.close().await {
                        debug!(error = %e, "error closing transport");
                    }
                    self.set_status(ConnectionStatus::Disconnected);

                    match result {
                        Ok(SessionEnd::Shutdown) => break,
                        Ok(SessionEnd::Closed) => {
                            info!(device = %self.device_id, "connection closed by server")
                        }
                        Err(e @ SyncError::Unauthorized(_)) => {
                            error!(
                                device = %self.device_id,
                                error = %e,
                                "not authorized, stopping"
                            );
                            return Err(e);
                        }
                        Err(e) => warn!(device = %self.device_id, error = %e, "connection lost"),
                    }
                }
                Err(e @ SyncError::Unauthorized(_)) => {
                    self.set_status(ConnectionStatus::Disconnected);
                    error!(device = %self.device_id, error = %e, "not authorized, stopping");
                    self.emit(AgentEvent::Rejected {
                        event_id: None,
                        code: codes::UNAUTHORIZED,
                        message: e.to_string(),
                    });
                    return Err(e);
                }
                Err(e) => {
                    self.set_status(ConnectionStatus::Disconnected);
                    warn!(device = %self.device_id, attempt, error = %e, "connect failed");
                }
            }

            let Some(delay) = self.config.reconnect.delay_for(attempt) else {
                error!(
                    device = %self.device_id,
                    attempts = attempt,
                    "reconnect attempts exhausted"
                );
                self.emit(AgentEvent::ReconnectExhausted { attempts: attempt });
                return Err(SyncError::ReconnectExhausted { attempts: attempt });
            };
            attempt += 1;
            info!(
                device = %self.device_id,
                attempt,
                max_attempts = self.config.reconnect.max_attempts,
                ?delay,
                "reconnecting"
            );
            self.emit(AgentEvent::Reconnecting { attempt, delay });

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }

        self.set_status(ConnectionStatus::Disconnected);
        info!(device = %self.device_id, "sync agent stopped");
        Ok(())
    }

    async fn run_session(
        &self,
        conn: &mut Connection<C::Transport>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SyncResult<SessionEnd> {
        // Absorb missed remote events before sending our own.
        self.send_sync_request(conn).await?;
        let reply = self
            .await_reply(conn, |r| {
                matches!(r, Reply::Response)
                    || matches!(r, Reply::Rejected(e) if e.event_id.is_none())
            })
            .await?;
        if let Reply::Rejected(err) = reply {
            return Err(err.into_error());
        }

        self.drain_queue(conn).await?;

        let now = Instant::now();
        let heartbeat_period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(now + heartbeat_period, heartbeat_period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let sync_period = self.config.periodic_sync_interval;
        let mut periodic_sync = tokio::time::interval_at(now + sync_period, sync_period);
        periodic_sync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = async { let _ = shutdown.wait_for(|stop| *stop).await; } => return Ok(SessionEnd::Shutdown),
                () = self.outgoing.notified() => self.drain_queue(conn).await?,
                message = conn.transport.recv() => {
                    let message = match message {
                        None => return Ok(SessionEnd::Closed),
                        Some(message) => message?,
                    };
                    conn.last_seen = Instant::now();
                    self.dispatch(conn, message).await?;
                }
                _ = heartbeat.tick() => {
                    let idle = conn.last_seen.elapsed();
                    if idle > self.config.heartbeat_timeout {
                        warn!(device = %self.device_id, ?idle, "heartbeat timeout");
                        return Err(SyncError::ConnectionTimeout(idle));
                    }
                    conn.transport.send(SyncMessage::ping()).await?;
                }
                _ = periodic_sync.tick() => {
                    debug!(device = %self.device_id, "periodic sync");
                    self.send_sync_request(conn).await?;
                }
            }
        }
    }

    async fn send_sync_request(&self, conn: &mut Connection<C::Transport>) -> SyncResult<()> {
        let request = SyncRequest {
            device_id: self.device_id.clone(),
            last_sequence: self.checkpoint(),
        };
        conn.transport.send(SyncMessage::SyncRequest(request)).await
    }

    /// Sends queued events in order, each awaiting its acknowledgement.
    async fn drain_queue(&self, conn: &mut Connection<C::Transport>) -> SyncResult<()> {
        loop {
            let next = lock(&self.state).queue.front().cloned();
            let Some(event) = next else {
                return Ok(());
            };
            let event_id = event.id;

            conn.transport.send(SyncMessage::SyncEvent(event.clone())).await?;
            let reply = self
                .await_reply(conn, |r| match r {
                    Reply::Ack(ack) => ack.event_id == event_id,
                    Reply::Rejected(err) => err.event_id == Some(event_id),
                    _ => false,
                })
                .await?;

            match reply {
                Reply::Ack(ack) => self.on_delivered(conn, &event, ack.sequence).await?,
                Reply::Rejected(err) if err.code == codes::BAD_REQUEST => {
                    error!(
                        event = %event_id,
                        message = %err.message,
                        "event rejected as malformed, dropping it"
                    );
                    self.local.remove(&event_id)?;
                    lock(&self.state).queue.retain(|e| e.id != event_id);
                }
                // Still queued; retried after reconnecting.
                Reply::Rejected(err) => return Err(err.into_error()),
                other => {
                    return Err(SyncError::Protocol(format!("unexpected reply {other:?}")));
                }
            }
        }
    }

    /// Reads messages until one matches `wanted`, handling everything else
    /// that arrives meanwhile. Bounded by the operation timeout.
    async fn await_reply(
        &self,
        conn: &mut Connection<C::Transport>,
        wanted: impl Fn(&Reply) -> bool,
    ) -> SyncResult<Reply> {
        let deadline = Instant::now() + self.config.op_timeout;
        loop {
            let message = tokio::select! {
                message = conn.transport.recv() => message,
                () = tokio::time::sleep_until(deadline) => {
                    warn!(device = %self.device_id, "timed out waiting for server reply");
                    return Err(SyncError::Timeout);
                }
            };
            let message = match message {
                None => return Err(SyncError::Network("connection closed".into())),
                Some(message) => message?,
            };
            conn.last_seen = Instant::now();

            let reply = self.dispatch(conn, message).await?;
            if wanted(&reply) {
                return Ok(reply);
            }
        }
    }

    /// Handles one inbound message.
    async fn dispatch(
        &self,
        conn: &mut Connection<C::Transport>,
        message: SyncMessage,
    ) -> SyncResult<Reply> {
        match message {
            SyncMessage::Ping(heartbeat) => {
                conn.transport.send(SyncMessage::Pong(heartbeat)).await?;
                Ok(Reply::Other)
            }
            SyncMessage::Pong(_) => Ok(Reply::Other),
            SyncMessage::SyncEvent(event) => {
                self.apply_remote(conn, event).await?;
                Ok(Reply::Other)
            }
            SyncMessage::SyncResponse(response) => {
                self.apply_response(conn, response).await?;
                Ok(Reply::Response)
            }
            SyncMessage::EventAck(ack) => Ok(Reply::Ack(ack)),
            SyncMessage::Error(err) => {
                warn!(
                    device = %self.device_id,
                    code = err.code,
                    message = %err.message,
                    "server rejected request"
                );
                self.emit(AgentEvent::Rejected {
                    event_id: err.event_id,
                    code: err.code,
                    message: err.message.clone(),
                });
                if err.code == codes::UNAUTHORIZED {
                    return Err(err.into_error());
                }
                Ok(Reply::Rejected(err))
            }
            other @ (SyncMessage::SyncRequest(_) | SyncMessage::Checkpoint(_)) => {
                warn!(kind = other.kind(), "unexpected message from server, ignoring");
                Ok(Reply::Other)
            }
        }
    }

    async fn apply_remote(
        &self,
        conn: &mut Connection<C::Transport>,
        event: SyncEvent,
    ) -> SyncResult<()> {
        let Some(sequence) = event.sequence else {
            warn!(event = %event.id, "remote event without sequence, ignoring");
            return Ok(());
        };
        if event.user_id != self.user_id {
            warn!(event = %event.id, "remote event for another user, ignoring");
            return Ok(());
        }

        let (applied, advanced) = {
            let mut state = lock(&self.state);
            let applied = state.cache.apply_remote(&event);
            // Only contiguous progress; gaps are filled by delta catch-up.
            let advanced = sequence == state.checkpoint + 1;
            if advanced {
                state.checkpoint = sequence;
            }
            (applied, advanced)
        };

        if advanced {
            self.persist_checkpoint(conn, sequence).await?;
        }
        if applied {
            debug!(
                event = %event.id,
                sequence,
                resource = %event.resource_key(),
                "remote event applied"
            );
            self.emit(AgentEvent::RemoteApplied {
                event_id: event.id,
                resource: event.resource_key(),
                sequence,
            });
        }
        Ok(())
    }

    async fn apply_response(
        &self,
        conn: &mut Connection<C::Transport>,
        response: SyncResponse,
    ) -> SyncResult<()> {
        let (applied, checkpoint, advanced) = {
            let mut state = lock(&self.state);
            let applied: Vec<&SyncEvent> = response
                .events
                .iter()
                .filter(|event| state.cache.apply_remote(event))
                .collect();
            let advanced = response.last_sync_sequence > state.checkpoint;
            if advanced {
                state.checkpoint = response.last_sync_sequence;
            }
            (applied, state.checkpoint, advanced)
        };

        if advanced {
            self.persist_checkpoint(conn, checkpoint).await?;
        }
        info!(
            device = %self.device_id,
            received = response.events.len(),
            applied = applied.len(),
            checkpoint,
            "delta applied"
        );
        for event in applied {
            self.emit(AgentEvent::RemoteApplied {
                event_id: event.id,
                resource: event.resource_key(),
                sequence: event.sequence.unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn on_delivered(
        &self,
        conn: &mut Connection<C::Transport>,
        event: &SyncEvent,
        sequence: u64,
    ) -> SyncResult<()> {
        self.local.remove(&event.id)?;
        let advanced = {
            let mut state = lock(&self.state);
            state.queue.retain(|e| e.id != event.id);
            state.cache.confirm_local(event, sequence);
            let advanced = sequence == state.checkpoint + 1;
            if advanced {
                state.checkpoint = sequence;
            }
            advanced
        };

        if advanced {
            self.persist_checkpoint(conn, sequence).await?;
        }
        debug!(event = %event.id, sequence, "event delivered");
        self.emit(AgentEvent::Delivered {
            event_id: event.id,
            sequence,
        });
        Ok(())
    }

    /// Persists the checkpoint locally and reports it to the coordinator.
    async fn persist_checkpoint(
        &self,
        conn: &mut Connection<C::Transport>,
        sequence: u64,
    ) -> SyncResult<()> {
        self.local.save_checkpoint(sequence)?;
        conn.transport
            .send(SyncMessage::Checkpoint(CheckpointReport {
                last_sequence: sequence,
            }))
            .await
    }

    fn set_status(&self, status: ConnectionStatus) {
        let changed = {
            let mut state = lock(&self.state);
            let changed = state.status != status;
            state.status = status;
            changed
        };
        if changed {
            self.emit(AgentEvent::StatusChanged(status));
        }
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }
}
