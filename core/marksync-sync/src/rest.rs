//! HTTP fallback client for devices that cannot hold a WebSocket open.
//!
//! Uses the same error mapping as the WebSocket path: `401` is fatal,
//! anything else comes back as [`SyncError::Rejected`] with the server's
//! code.

use crate::error::{SyncError, SyncResult};
use crate::protocol::{ErrorMessage, EventAck, SyncResponse};
use marksync_types::{DeviceId, DeviceSyncState, SyncEvent};
use reqwest::{Client, Response, Url};
use std::time::Duration;
use tracing::debug;

/// Header carrying the caller's device id.
pub const DEVICE_ID_HEADER: &str = "x-device-id";

/// REST client for one device.
#[derive(Debug, Clone)]
pub struct RestClient {
    client: Client,
    base: Url,
    token: String,
    device_id: DeviceId,
}

impl RestClient {
    /// Creates a client for `base_url` (`http://host:port`).
    pub fn new(base_url: &str, token: impl Into<String>, device_id: DeviceId) -> SyncResult<Self> {
        Self::with_timeout(base_url, token, device_id, Duration::from_secs(10))
    }

    /// Creates a client whose requests fail with [`SyncError::Timeout`]
    /// after `timeout`.
    pub fn with_timeout(
        base_url: &str,
        token: impl Into<String>,
        device_id: DeviceId,
        timeout: Duration,
    ) -> SyncResult<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| SyncError::Protocol(format!("invalid server url '{base_url}': {e}")))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Network(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base,
            token: token.into(),
            device_id,
        })
    }

    /// Submits one event. Idempotent on the event id.
    pub async fn post_event(&self, event: &SyncEvent) -> SyncResult<EventAck> {
        debug!(event = %event.id, "posting event over REST");
        let response = self
            .client
            .post(self.url("sync/events")?)
            .bearer_auth(&self.token)
            .header(DEVICE_ID_HEADER, self.device_id.as_str())
            .json(event)
            .send()
            .await
            .map_err(map_transport_error)?;
        parse(response).await
    }

    /// Fetches events after `since` from other devices.
    pub async fn fetch_delta(&self, since: u64) -> SyncResult<SyncResponse> {
        let mut url = self.url("sync/events")?;
        url.query_pairs_mut().append_pair("since", &since.to_string());
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .header(DEVICE_ID_HEADER, self.device_id.as_str())
            .send()
            .await
            .map_err(map_transport_error)?;
        parse(response).await
    }

    /// Fetches this device's sync state as the coordinator sees it.
    pub async fn get_state(&self) -> SyncResult<DeviceSyncState> {
        let response = self
            .client
            .get(self.url("sync/state")?)
            .bearer_auth(&self.token)
            .header(DEVICE_ID_HEADER, self.device_id.as_str())
            .send()
            .await
            .map_err(map_transport_error)?;
        parse(response).await
    }

    fn url(&self, path: &str) -> SyncResult<Url> {
        self.base
            .join(path)
            .map_err(|e| SyncError::Protocol(format!("invalid path '{path}': {e}")))
    }
}

fn map_transport_error(e: reqwest::Error) -> SyncError {
    if e.is_timeout() {
        SyncError::Timeout
    } else {
        SyncError::Network(e.to_string())
    }
}

async fn parse<T: serde::de::DeserializeOwned>(response: Response) -> SyncResult<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| SyncError::Protocol(format!("invalid response body: {e}")));
    }

    let body = response.text().await.unwrap_or_default();
    let err = match serde_json::from_str::<ErrorMessage>(&body) {
        Ok(message) => message.into_error(),
        Err(_) if status.as_u16() == 401 => SyncError::Unauthorized(body),
        Err(_) => SyncError::Rejected {
            code: status.as_u16(),
            message: body,
        },
    };
    Err(err)
}
