//! CLI argument parsing for the jetflow daemon.

use clap::Parser;
use jetflow_firehose::{FirehoseConfig, SubscriberOptions};
use jetflow_net::RacerConfig;
use std::path::PathBuf;
use std::time::Duration;

/// jetflow - resilient firehose ingestion daemon
///
/// Consumes a jetstream-style event firehose over WebSocket, checkpoints
/// its cursor so ingestion resumes after failure, and dispatches events to
/// a bounded worker pool.
#[derive(Parser, Debug)]
#[command(name = "jetflowd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Firehose WebSocket endpoint
    #[arg(
        long,
        default_value = "wss://jetstream2.us-east.bsky.network/subscribe",
        env = "JETFLOW_ENDPOINT"
    )]
    pub endpoint: String,

    /// Concurrent event workers
    #[arg(long, default_value = "16", env = "JETFLOW_WORKERS")]
    pub workers: usize,

    /// Permit outbound connections to loopback/link-local/private addresses
    /// (disables the SSRF filter; local development only)
    #[arg(long, default_value = "false", env = "JETFLOW_ALLOW_LOCAL")]
    pub allow_local: bool,

    /// Data directory for the file-backed shared store
    #[arg(short, long, default_value = "./data", env = "JETFLOW_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Seconds between cursor checkpoints
    #[arg(long, default_value = "3", env = "JETFLOW_CHECKPOINT_SECS")]
    pub checkpoint_secs: u64,

    /// Resume cursor override (microsecond timestamp); defaults to the
    /// persisted checkpoint
    #[arg(long, env = "JETFLOW_CURSOR")]
    pub cursor: Option<u64>,

    /// Record collections to subscribe to (comma-separated; empty = all)
    #[arg(long, value_delimiter = ',', env = "JETFLOW_COLLECTIONS")]
    pub wanted_collections: Vec<String>,

    /// Actor DIDs to subscribe to (comma-separated; empty = all)
    #[arg(long, value_delimiter = ',', env = "JETFLOW_DIDS")]
    pub wanted_dids: Vec<String>,

    /// Largest frame to request from the server, bytes
    #[arg(long, default_value = "1048576", env = "JETFLOW_MAX_MESSAGE_SIZE")]
    pub max_message_size_bytes: u64,

    /// Delay between reconnect attempts, milliseconds (0 = reconnect
    /// immediately)
    #[arg(long, default_value = "0", env = "JETFLOW_RECONNECT_DELAY_MS")]
    pub reconnect_delay_ms: u64,

    /// Owner identity for cross-process locks; defaults to the OS pid
    #[arg(long, env = "JETFLOW_PROCESS_ID")]
    pub process_id: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,
}

impl Cli {
    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("--workers must be at least 1".to_string());
        }
        if !self.endpoint.starts_with("ws://") && !self.endpoint.starts_with("wss://") {
            return Err(format!(
                "endpoint must be a ws:// or wss:// URL, got {}",
                self.endpoint
            ));
        }
        Ok(())
    }

    pub fn firehose_config(&self) -> FirehoseConfig {
        FirehoseConfig::builder()
            .endpoint(self.endpoint.clone())
            .worker_concurrency(self.workers)
            .checkpoint_interval(Duration::from_secs(self.checkpoint_secs.max(1)))
            .racer(RacerConfig::default().allow_local(self.allow_local))
            .build()
    }

    /// Options sent to the server right after each connect. With
    /// `requireHello`, the server holds events until these arrive.
    pub fn subscriber_options(&self) -> SubscriberOptions {
        SubscriberOptions {
            wanted_collections: self.wanted_collections.clone(),
            wanted_dids: self.wanted_dids.clone(),
            max_message_size_bytes: self.max_message_size_bytes,
        }
    }

    pub fn owner_id(&self) -> u64 {
        self.process_id.unwrap_or_else(|| std::process::id() as u64)
    }
}
