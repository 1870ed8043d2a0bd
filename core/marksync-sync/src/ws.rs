//! WebSocket transport backed by tokio-tungstenite.

use crate::error::{SyncError, SyncResult};
use crate::protocol::SyncMessage;
use crate::transport::{SyncTransport, TransportConnector};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use marksync_types::DeviceId;
use reqwest::Url;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`SyncTransport`] over one WebSocket connection.
pub struct WsTransport {
    ws: WsStream,
}

#[async_trait]
impl SyncTransport for WsTransport {
    async fn send(&mut self, message: SyncMessage) -> SyncResult<()> {
        let text = message.to_json()?;
        self.ws
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| SyncError::Network(e.to_string()))
    }

    async fn recv(&mut self) -> Option<SyncResult<SyncMessage>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => return Some(SyncMessage::from_json(text.as_str())),
                Ok(Message::Close(_)) => return None,
                // tungstenite answers pings itself on the next read or write.
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Ok(Message::Binary(_)) => {
                    return Some(Err(SyncError::Protocol("unexpected binary frame".into())));
                }
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return None;
                }
                Err(e) => return Some(Err(SyncError::Network(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) -> SyncResult<()> {
        match self.ws.close(None).await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Ok(())
            }
            Err(e) => Err(SyncError::Network(e.to_string())),
        }
    }
}

/// Connects to `<server>/sync/ws?token=..&deviceId=..`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    /// Builds a connector for a device. `server_url` is the `ws://` or
    /// `wss://` base of the sync server.
    pub fn new(server_url: &str, token: &str, device_id: &DeviceId) -> SyncResult<Self> {
        let base = Url::parse(server_url)
            .map_err(|e| SyncError::Protocol(format!("invalid server url '{server_url}': {e}")))?;
        let mut url = base
            .join("sync/ws")
            .map_err(|e| SyncError::Protocol(format!("invalid server url '{server_url}': {e}")))?;
        url.query_pairs_mut()
            .append_pair("token", token)
            .append_pair("deviceId", device_id.as_str());
        Ok(Self { url })
    }

    /// The full connection URL.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl TransportConnector for WsConnector {
    type Transport = WsTransport;

    async fn connect(&self) -> SyncResult<WsTransport> {
        debug!(url = %self.url.path(), "connecting websocket");
        match connect_async(self.url.as_str()).await {
            Ok((ws, _response)) => Ok(WsTransport { ws }),
            Err(tungstenite::Error::Http(response)) if response.status().as_u16() == 401 => {
                Err(SyncError::Unauthorized("server rejected credentials".into()))
            }
            Err(e) => Err(SyncError::Network(e.to_string())),
        }
    }
}
