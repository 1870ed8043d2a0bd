//! In-process transport attaching an agent directly to a coordinator.
//!
//! Each `connect` accepts a session on the coordinator and spawns a bridge
//! task playing the part of the server's connection loop. Connectivity
//! can be toggled to simulate outages.

use crate::coordinator::SyncCoordinator;
use crate::error::{SyncError, SyncResult};
use crate::protocol::SyncMessage;
use crate::session::{CloseReason, SessionLink};
use crate::transport::{SyncTransport, TransportConnector};
use async_trait::async_trait;
use marksync_types::{DeviceId, UserId};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Notify, mpsc};
use tracing::debug;

const BRIDGE_BUFFER: usize = 64;

/// Connects one device to an in-process [`SyncCoordinator`].
#[derive(Clone)]
pub struct LocalConnector {
    coordinator: Arc<SyncCoordinator>,
    user_id: UserId,
    device_id: DeviceId,
    online: Arc<AtomicBool>,
    sever: Arc<Notify>,
}

impl LocalConnector {
    pub fn new(coordinator: Arc<SyncCoordinator>, user_id: UserId, device_id: DeviceId) -> Self {
        Self {
            coordinator,
            user_id,
            device_id,
            online: Arc::new(AtomicBool::new(true)),
            sever: Arc::new(Notify::new()),
        }
    }

    /// Takes the device offline or back online. Going offline drops the
    /// current connection and makes further connects fail.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if !online {
            self.sever.notify_waiters();
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// The agent's end of an in-process connection.
pub struct LocalTransport {
    to_server: mpsc::Sender<SyncMessage>,
    from_server: mpsc::Receiver<SyncMessage>,
}

#[async_trait]
impl SyncTransport for LocalTransport {
    async fn send(&mut self, message: SyncMessage) -> SyncResult<()> {
        self.to_server
            .send(message)
            .await
            .map_err(|_| SyncError::Network("connection closed".into()))
    }

    async fn recv(&mut self) -> Option<SyncResult<SyncMessage>> {
        self.from_server.recv().await.map(Ok)
    }

    async fn close(&mut self) -> SyncResult<()> {
        self.from_server.close();
        Ok(())
    }
}

#[async_trait]
impl TransportConnector for LocalConnector {
    type Transport = LocalTransport;

    async fn connect(&self) -> SyncResult<LocalTransport> {
        if !self.is_online() {
            return Err(SyncError::Network("device offline".into()));
        }

        let link = self
            .coordinator
            .accept(self.user_id.clone(), self.device_id.clone())
            .await?;
        let (to_server, inbound) = mpsc::channel(BRIDGE_BUFFER);
        let (to_client, from_server) = mpsc::channel(BRIDGE_BUFFER);

        tokio::spawn(bridge(
            self.coordinator.clone(),
            link,
            inbound,
            to_client,
            self.sever.clone(),
        ));
        Ok(LocalTransport {
            to_server,
            from_server,
        })
    }
}

async fn bridge(
    coordinator: Arc<SyncCoordinator>,
    mut link: SessionLink,
    mut inbound: mpsc::Receiver<SyncMessage>,
    to_client: mpsc::Sender<SyncMessage>,
    sever: Arc<Notify>,
) {
    let session = link.session.clone();
    let severed = sever.notified();
    tokio::pin!(severed);

    let reason = loop {
        tokio::select! {
            message = inbound.recv() => {
                let Some(message) = message else {
                    break CloseReason::ClientDisconnect;
                };
                let mut disconnected = false;
                for reply in coordinator.handle_message(&session, message).await {
                    if to_client.send(reply).await.is_err() {
                        disconnected = true;
                        break;
                    }
                }
                if disconnected {
                    break CloseReason::ClientDisconnect;
                }
            }
            outbound = link.outbound.recv() => {
                let Some(message) = outbound else {
                    break CloseReason::Shutdown;
                };
                if to_client.send(message).await.is_err() {
                    break CloseReason::ClientDisconnect;
                }
            }
            reason = link.closed.wait() => break reason,
            () = &mut severed => break CloseReason::ClientDisconnect,
        }
    };

    debug!(session = session.id(), %reason, "local bridge finished");
    coordinator.close_session(&session, reason).await;
}
