//! HTTP and WebSocket front end for the marksync sync coordinator.

pub mod config;
pub mod error;
pub mod identity;
pub mod jobs;
pub mod routes;
pub mod ws;

use axum::Router;
use axum::routing::{get, post};
use identity::IdentityResolver;
use marksync_sync::SyncCoordinator;
use std::sync::Arc;

pub use config::Args;
pub use error::ApiError;
pub use identity::{Identity, StaticIdentityResolver};
pub use routes::HealthResponse;

/// Shared state of all handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SyncCoordinator>,
    pub identities: Arc<dyn IdentityResolver>,
}

impl AppState {
    pub fn new(coordinator: Arc<SyncCoordinator>, identities: Arc<dyn IdentityResolver>) -> Self {
        Self {
            coordinator,
            identities,
        }
    }
}

/// Build the HTTP API router with the given state.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(routes::health))
        .route("/sync/ws", get(ws::upgrade))
        .route("/sync/events", post(routes::post_event).get(routes::get_events))
        .route("/sync/state", get(routes::get_state))
        .with_state(state)
}
