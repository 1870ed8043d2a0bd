//! marksync sync server
//!
//! Accepts device connections over WebSocket (and a REST fallback),
//! persists their bookmark events and pushes them to the user's other
//! devices.
//!
//! Usage:
//!   marksync-server --port 8080 --database marksync.db --tokens tokens.json

use anyhow::{Context, Result};
use clap::Parser;
use marksync_jobs::{Dispatcher, DispatcherConfig, JobRegistry};
use marksync_server::jobs::{WEBHOOK_JOB, WebhookHandler, WebhookPlanner};
use marksync_server::{AppState, Args, StaticIdentityResolver, build_router};
use marksync_storage::{MemoryEventStore, SqliteEventStore, SyncEventStore};
use marksync_sync::{SideEffects, SyncCoordinator};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("marksync server starting...");

    let store: Arc<dyn SyncEventStore> = match &args.database {
        Some(path) => {
            info!(path = %path.display(), "opening event store");
            Arc::new(
                SqliteEventStore::open(path)
                    .with_context(|| format!("failed to open database {}", path.display()))?,
            )
        }
        None => {
            warn!("no database configured, events are kept in memory only");
            Arc::new(MemoryEventStore::new())
        }
    };
    let identities = StaticIdentityResolver::from_file(&args.tokens)?;

    let mut registry = JobRegistry::new();
    if args.webhook_url.is_some() {
        let handler = WebhookHandler::new(Duration::from_secs(10))
            .context("failed to create HTTP client")?;
        registry.register(WEBHOOK_JOB, Arc::new(handler));
    }
    let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig::default(), registry));
    dispatcher
        .start(args.workers, args.queue_capacity)
        .context("failed to start job dispatcher")?;

    let mut coordinator = SyncCoordinator::new(args.coordinator_config(), store);
    if let Some(url) = &args.webhook_url {
        info!(url = %url, "webhook delivery enabled");
        coordinator = coordinator.with_side_effects(SideEffects {
            dispatcher: dispatcher.clone(),
            planner: Arc::new(WebhookPlanner::new(url)),
        });
    }
    let coordinator = Arc::new(coordinator);
    let heartbeat = coordinator.spawn_heartbeat_monitor();

    let app = build_router(AppState::new(coordinator.clone(), Arc::new(identities)));
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("shutting down");
    heartbeat.abort();
    coordinator.shutdown().await;
    let report = dispatcher.stop().await;
    if !report.clean {
        warn!(abandoned = report.abandoned, "job dispatcher did not drain cleanly");
    }
    info!("marksync server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
