//! WebSocket connection loop.

use crate::AppState;
use crate::error::ApiError;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use marksync_sync::{
    CloseReason, ErrorMessage, SessionLink, SyncCoordinator, SyncError, SyncMessage,
};
use marksync_types::{DeviceId, UserId};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Query parameters for WebSocket connection
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectQuery {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub device_id: String,
}

/// `GET /sync/ws?token=..&deviceId=..`
///
/// Credentials are checked before the upgrade, so a bad token is a plain
/// HTTP 401.
pub async fn upgrade(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let device_id = DeviceId::new(query.device_id);
    let Some(identity) = state.identities.resolve(&query.token, &device_id) else {
        warn!(device = %device_id, "WebSocket connection rejected: invalid or missing token");
        return Err(ApiError::Unauthorized("invalid or missing token".into()));
    };

    let coordinator = state.coordinator.clone();
    Ok(ws.on_upgrade(move |socket| {
        serve_connection(socket, coordinator, identity.user_id, identity.device_id)
    }))
}

type WsSink = SplitSink<WebSocket, Message>;

/// Runs one device connection until either side closes it.
pub async fn serve_connection(
    socket: WebSocket,
    coordinator: Arc<SyncCoordinator>,
    user_id: UserId,
    device_id: DeviceId,
) {
    let (mut sink, mut stream) = socket.split();

    let link = match coordinator.accept(user_id, device_id).await {
        Ok(link) => link,
        Err(err) => {
            warn!(error = %err, "session rejected");
            let _ = send(&mut sink, SyncMessage::Error(ErrorMessage::from_error(&err, None))).await;
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };
    let SessionLink {
        session,
        mut outbound,
        mut closed,
        ..
    } = link;

    let reason = loop {
        tokio::select! {
            frame = stream.next() => {
                let message = match frame {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        debug!(session = session.id(), error = %e, "websocket read failed");
                        break CloseReason::ClientDisconnect;
                    }
                    None => break CloseReason::ClientDisconnect,
                };
                let replies = match message {
                    Message::Text(text) => match SyncMessage::from_json(text.as_str()) {
                        Ok(message) => coordinator.handle_message(&session, message).await,
                        Err(err) => {
                            session.touch();
                            vec![SyncMessage::Error(ErrorMessage::from_error(&err, None))]
                        }
                    },
                    // axum answers pings itself; both still count as traffic.
                    Message::Ping(_) | Message::Pong(_) => {
                        session.touch();
                        Vec::new()
                    }
                    Message::Binary(_) => {
                        let err = SyncError::Protocol("binary frames are not supported".into());
                        vec![SyncMessage::Error(ErrorMessage::from_error(&err, None))]
                    }
                    Message::Close(_) => break CloseReason::ClientDisconnect,
                };
                if send_all(&mut sink, replies).await.is_err() {
                    break CloseReason::ClientDisconnect;
                }
            }
            message = outbound.recv() => {
                let Some(message) = message else {
                    break CloseReason::Shutdown;
                };
                if send(&mut sink, message).await.is_err() {
                    break CloseReason::ClientDisconnect;
                }
            }
            reason = closed.wait() => break reason,
        }
    };

    coordinator.close_session(&session, reason).await;
    let _ = sink.send(Message::Close(None)).await;
    info!(session = session.id(), %reason, "websocket connection finished");
}

async fn send(sink: &mut WsSink, message: SyncMessage) -> Result<(), SyncError> {
    let text = message.to_json()?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| SyncError::Network(e.to_string()))
}

async fn send_all(sink: &mut WsSink, messages: Vec<SyncMessage>) -> Result<(), SyncError> {
    for message in messages {
        send(sink, message).await?;
    }
    Ok(())
}
