//! API error types and response formatting.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use marksync_sync::protocol::codes;
use marksync_sync::{ErrorMessage, SyncError};

/// API error type that converts to appropriate HTTP responses.
///
/// The body has the shape of a wire `error` message so REST clients parse
/// it the same way as WebSocket clients.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Missing or invalid credentials, or data for another identity.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The event store failed; retry later.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store did not answer within the deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        let message = err.to_string();
        match err.code() {
            codes::UNAUTHORIZED => Self::Unauthorized(message),
            codes::BAD_REQUEST => Self::BadRequest(message),
            codes::STORE_UNAVAILABLE => Self::StoreUnavailable(message),
            codes::TIMEOUT => Self::Timeout(message),
            _ => Self::Internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::Internal(detail) => {
                tracing::error!(error = %detail, "internal server error");
                "an internal error occurred".to_string()
            }
            Self::Unauthorized(detail)
            | Self::BadRequest(detail)
            | Self::StoreUnavailable(detail)
            | Self::Timeout(detail) => detail.clone(),
        };

        let body = ErrorMessage {
            code: status.as_u16(),
            message,
            event_id: None,
        };
        (status, Json(body)).into_response()
    }
}
