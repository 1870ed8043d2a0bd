//! REST fallback and health endpoints.

use crate::AppState;
use crate::error::ApiError;
use crate::identity::Identity;
use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequestParts, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use marksync_sync::{DEVICE_ID_HEADER, EventAck, SyncResponse};
use marksync_types::{DeviceId, DeviceSyncState, SyncEvent};
use serde::{Deserialize, Serialize};
use tracing::debug;

impl FromRequestParts<AppState> for Identity {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| ApiError::Unauthorized("missing bearer token".into()))?;
        let device_id = parts
            .headers
            .get(DEVICE_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(DeviceId::new)
            .ok_or_else(|| ApiError::Unauthorized(format!("missing {DEVICE_ID_HEADER} header")))?;

        state
            .identities
            .resolve(token, &device_id)
            .ok_or_else(|| ApiError::Unauthorized("invalid token".into()))
    }
}

/// `POST /sync/events`
pub async fn post_event(
    State(state): State<AppState>,
    identity: Identity,
    body: Result<Json<SyncEvent>, JsonRejection>,
) -> Result<Json<EventAck>, ApiError> {
    let Json(event) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let event_id = event.id;
    let outcome = state
        .coordinator
        .ingest(&identity.user_id, &identity.device_id, event)
        .await?;
    debug!(event = %event_id, sequence = outcome.sequence(), "event ingested over REST");
    Ok(Json(EventAck {
        event_id,
        sequence: outcome.sequence(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct DeltaQuery {
    #[serde(default)]
    since: u64,
}

/// `GET /sync/events?since=N`
pub async fn get_events(
    State(state): State<AppState>,
    identity: Identity,
    Query(query): Query<DeltaQuery>,
) -> Result<Json<SyncResponse>, ApiError> {
    let response = state
        .coordinator
        .delta_since(&identity.user_id, &identity.device_id, query.since)
        .await?;
    Ok(Json(response))
}

/// `GET /sync/state`
pub async fn get_state(
    State(state): State<AppState>,
    identity: Identity,
) -> Result<Json<DeviceSyncState>, ApiError> {
    let device_state = state
        .coordinator
        .device_state(&identity.user_id, &identity.device_id)
        .await?;
    Ok(Json(device_state))
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub live_sessions: usize,
}

/// `GET /api/v1/health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        live_sessions: state.coordinator.live_sessions(),
    })
}
