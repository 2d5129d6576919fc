//! jetflow daemon - resilient firehose ingestion
//!
//! Usage:
//!   # Consume the default endpoint, checkpointing under ./data
//!   jetflowd
//!
//!   # Subscribe to specific collections with a custom worker pool
//!   jetflowd --wanted-collections app.bsky.feed.post --workers 32
//!
//!   # Resume from an explicit cursor
//!   jetflowd --cursor 1700000000000000

mod cli;

use clap::Parser;
use cli::Cli;
use jetflow_core::{FileStore, SharedStoreRef};
use jetflow_firehose::{LoggingSink, SessionHook, SinkRef, SubscriberMessage, Supervisor};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = cli.validate() {
        eprintln!("Configuration error: {e}");
        std::process::exit(1);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        endpoint = %cli.endpoint,
        workers = cli.workers,
        owner = cli.owner_id(),
        "starting jetflowd"
    );

    let store: SharedStoreRef = Arc::new(FileStore::new(&cli.data_dir).await?);
    let sink: SinkRef = Arc::new(LoggingSink);

    let options = cli.subscriber_options();
    let hello: SessionHook = Arc::new(move |handle| {
        let options = options.clone();
        Box::pin(async move {
            handle.send(SubscriberMessage::options(options)).await?;
            Ok(())
        })
    });

    let mut supervisor =
        Supervisor::new(cli.firehose_config(), store, sink).with_connect_hook(hello);
    if cli.reconnect_delay_ms > 0 {
        supervisor = supervisor.with_reconnect_delay(Duration::from_millis(cli.reconnect_delay_ms));
    }
    if let Some(cursor) = cli.cursor {
        supervisor = supervisor.with_initial_cursor(cursor);
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            wait_for_shutdown_signal().await;
            info!("shutdown signal received, draining");
            cancel.cancel();
        }
    });

    // Runs until cancelled; each session drains its workers and flushes the
    // cursor on the way out.
    supervisor.run(cancel).await;

    info!("goodbye");
    Ok(())
}

/// Wait for shutdown signals (Ctrl+C or SIGTERM).
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
