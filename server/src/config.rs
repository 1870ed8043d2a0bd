//! Command-line and environment configuration.

use clap::Parser;
use marksync_sync::{CoordinatorConfig, HeartbeatConfig};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "marksync-server")]
#[command(about = "marksync bookmark sync server")]
pub struct Args {
    /// Port for HTTP and WebSocket connections
    #[arg(short, long, env = "MARKSYNC_PORT", default_value = "8080")]
    pub port: u16,

    /// SQLite database path; events are kept in memory when absent
    #[arg(long, env = "MARKSYNC_DATABASE")]
    pub database: Option<PathBuf>,

    /// JSON file mapping tokens to user ids
    #[arg(short, long, env = "MARKSYNC_TOKENS", default_value = "tokens.json")]
    pub tokens: PathBuf,

    /// Background job workers
    #[arg(long, env = "MARKSYNC_WORKERS", default_value = "4")]
    pub workers: usize,

    /// Background job queue capacity
    #[arg(long, env = "MARKSYNC_QUEUE_CAPACITY", default_value = "1024")]
    pub queue_capacity: usize,

    /// Seconds between heartbeats; sessions silent for twice this long are closed
    #[arg(long, env = "MARKSYNC_HEARTBEAT_SECS", default_value = "30")]
    pub heartbeat_secs: u64,

    /// POST every ingested event to this URL
    #[arg(long, env = "MARKSYNC_WEBHOOK_URL")]
    pub webhook_url: Option<String>,

    /// Enable verbose debug logging
    #[arg(short, long, env = "MARKSYNC_VERBOSE")]
    pub verbose: bool,
}

impl Args {
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        let interval = Duration::from_secs(self.heartbeat_secs.max(1));
        CoordinatorConfig {
            heartbeat: HeartbeatConfig {
                interval,
                timeout: interval * 2,
            },
            ..CoordinatorConfig::default()
        }
    }
}
