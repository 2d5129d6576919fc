//! Reconnect supervision: a failed session is a reason to connect again,
//! not to stop.

use crate::client::{ConnectHook, FirehoseClient, FirehoseHandle};
use crate::config::FirehoseConfig;
use crate::sink::SinkRef;
use futures::future::BoxFuture;
use jetflow_core::SharedStoreRef;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Per-session hook; receives the new session's control handle so it can
/// send the initial subscription options.
pub type SessionHook =
    Arc<dyn Fn(FirehoseHandle) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Owns the firehose client lifecycle: while not cancelled, run a fresh
/// session and convert any non-cancellation failure into a reconnect from
/// the last observed cursor.
pub struct Supervisor {
    config: FirehoseConfig,
    store: SharedStoreRef,
    sink: SinkRef,
    on_connect: Option<SessionHook>,
    reconnect_delay: Option<Duration>,
    initial_cursor: Option<u64>,
}

impl Supervisor {
    pub fn new(config: FirehoseConfig, store: SharedStoreRef, sink: SinkRef) -> Self {
        Self {
            config,
            store,
            sink,
            on_connect: None,
            reconnect_delay: None,
            initial_cursor: None,
        }
    }

    /// Run `hook` after each (re)connect, before reading starts.
    pub fn with_connect_hook(mut self, hook: SessionHook) -> Self {
        self.on_connect = Some(hook);
        self
    }

    /// Wait `delay` between reconnect attempts. The default is no delay:
    /// reconnection is cheap relative to the cost of losing events, and a
    /// reconnect resumes from the cursor anyway.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = Some(delay);
        self
    }

    /// Start the first session from `cursor` instead of the persisted
    /// checkpoint.
    pub fn with_initial_cursor(mut self, cursor: u64) -> Self {
        self.initial_cursor = Some(cursor);
        self
    }

    /// Reconnect-forever loop. Returns only when `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        // First session resumes from the persisted checkpoint (or the
        // caller's override); later ones resume from the failed session's
        // in-memory cursor, which may be ahead of the last flush.
        let mut cursor: Option<u64> = self.initial_cursor;

        while !cancel.is_cancelled() {
            let client =
                FirehoseClient::new(self.config.clone(), self.store.clone(), self.sink.clone());

            let hook: Option<ConnectHook> = self.on_connect.clone().map(|hook| {
                let handle = client.handle();
                Arc::new(move || hook(handle.clone())) as ConnectHook
            });

            match client.listen(cursor, hook, cancel.child_token()).await {
                Ok(()) => info!("firehose session stopped"),
                Err(e) => error!(error = %e, "firehose session failed, reconnecting"),
            }

            cursor = Some(client.cursor()).filter(|c| *c != 0);

            if let Some(delay) = self.reconnect_delay {
                if cancel.is_cancelled() {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = sleep(delay) => {}
                }
            }
        }
    }
}
