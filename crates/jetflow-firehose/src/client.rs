//! One firehose session: connect, read, decode, checkpoint, dispatch.
//!
//! A session is three cooperating tasks over one WebSocket:
//!
//! - **reader**: owns the socket. Complete messages go down a bounded frame
//!   pipe; control frames from the session handle go out through the write
//!   half (the reader is the single logical writer).
//! - **dispatcher**: decodes envelopes, advances the cursor, and spawns one
//!   worker per envelope behind a counting semaphore. A full pipe or an
//!   exhausted semaphore blocks this path, which backpressures the reader
//!   and ultimately the transport.
//! - **checkpointer**: flushes the cursor to the shared store on a fixed
//!   interval, fire-and-forget.
//!
//! A transport failure anywhere tears the session down; the caller (the
//! reconnect supervisor) decides what happens next. Cancellation is a clean
//! stop, not an error. Teardown always persists the cursor once more and
//! waits for outstanding workers.

use crate::config::FirehoseConfig;
use crate::control::SubscriberMessage;
use crate::event::decode_frame;
use crate::sink::SinkRef;
use crate::{Error, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use jetflow_core::SharedStoreRef;
use jetflow_net::Racer;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::client_async_tls;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

/// Caller-supplied action run after the transport connects, before reading
/// starts. Used to send an initial subscription-options frame.
pub type ConnectHook =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Handle for sending control frames into a running session.
///
/// Frames are funneled through the session's single writer, so concurrent
/// `send` calls never interleave on the wire.
#[derive(Clone)]
pub struct FirehoseHandle {
    tx: mpsc::Sender<SubscriberMessage>,
}

impl FirehoseHandle {
    pub async fn send(&self, msg: SubscriberMessage) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| Error::Transport("session is not running".into()))
    }
}

/// One streaming session against the firehose endpoint.
pub struct FirehoseClient {
    config: FirehoseConfig,
    store: SharedStoreRef,
    sink: SinkRef,
    racer: Racer,
    cursor: AtomicU64,
    received: AtomicU64,
    control_tx: mpsc::Sender<SubscriberMessage>,
    control_rx: parking_lot::Mutex<Option<mpsc::Receiver<SubscriberMessage>>>,
}

impl FirehoseClient {
    pub fn new(config: FirehoseConfig, store: SharedStoreRef, sink: SinkRef) -> Self {
        let (control_tx, control_rx) = mpsc::channel(16);
        Self {
            racer: Racer::new(config.racer.clone()),
            config,
            store,
            sink,
            cursor: AtomicU64::new(0),
            received: AtomicU64::new(0),
            control_tx,
            control_rx: parking_lot::Mutex::new(Some(control_rx)),
        }
    }

    /// Control-frame handle; valid for this client's session.
    pub fn handle(&self) -> FirehoseHandle {
        FirehoseHandle {
            tx: self.control_tx.clone(),
        }
    }

    /// The in-memory cursor: the highest `time_us` observed this session.
    /// May be ahead of the last persisted checkpoint.
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    /// Run one session until transport failure or cancellation.
    ///
    /// The cursor starts from `cursor_override` when given, else from the
    /// shared store. Cancellation returns `Ok`; teardown (cursor flush +
    /// worker drain) runs on every exit path.
    pub async fn listen(
        &self,
        cursor_override: Option<u64>,
        on_connect: Option<ConnectHook>,
        cancel: CancellationToken,
    ) -> Result<()> {
        match cursor_override {
            Some(c) => self.cursor.store(c, Ordering::Release),
            None => {
                if let Some(saved) = self.store.get_u64(&self.config.cursor_key).await? {
                    self.cursor.store(saved, Ordering::Release);
                }
            }
        }

        let tracker = TaskTracker::new();
        let result = self.run_session(&tracker, on_connect, &cancel).await;

        // Teardown: freshest cursor to the store, then drain the workers.
        let cursor = self.cursor.load(Ordering::Acquire);
        if cursor != 0 {
            if let Err(e) = self.store.put_u64(&self.config.cursor_key, cursor).await {
                warn!(error = %e, "failed to persist cursor at teardown");
            }
        }
        tracker.close();
        if !tracker.is_empty() {
            info!(workers = tracker.len(), "waiting for outstanding workers");
        }
        tracker.wait().await;

        match result {
            Err(_) if cancel.is_cancelled() => Ok(()),
            other => other,
        }
    }

    async fn run_session(
        &self,
        tracker: &TaskTracker,
        on_connect: Option<ConnectHook>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let url = self.session_url();
        let (host, port) = endpoint_host_port(&self.config.endpoint)?;
        info!(endpoint = %url, "connecting to firehose");

        let tcp = match self.racer.connect(&host, port, cancel).await {
            Ok(stream) => stream,
            Err(jetflow_net::Error::Cancelled) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let (ws, _response) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            res = client_async_tls(url, tcp) => res?,
        };
        debug!("connected");

        if let Some(hook) = on_connect {
            hook()
                .await
                .map_err(|e| Error::Handshake(format!("post-connect hook failed: {e}")))?;
        }

        let (mut write, mut read) = ws.split();
        let (frame_tx, mut frame_rx) = mpsc::channel::<Bytes>(self.config.frame_pipe_depth);
        let control_rx = self.control_rx.lock().take();

        let reader_cancel = cancel.clone();
        let reader = async move {
            let mut control_open = control_rx.is_some();
            // Drained but never yielding; keeps the select arm uniform.
            let (_ghost_tx, ghost_rx) = mpsc::channel(1);
            let mut control_rx = control_rx.unwrap_or(ghost_rx);

            loop {
                let frame = tokio::select! {
                    _ = reader_cancel.cancelled() => {
                        let _ = write.close().await;
                        return Ok(());
                    }
                    outbound = control_rx.recv(), if control_open => {
                        match outbound {
                            Some(msg) => {
                                let json = serde_json::to_string(&msg).map_err(|e| {
                                    Error::Transport(format!("control frame encoding: {e}"))
                                })?;
                                trace!(frame = %json, "sending control frame");
                                tokio::select! {
                                    _ = reader_cancel.cancelled() => return Ok(()),
                                    res = write.send(Message::text(json)) => res?,
                                }
                            }
                            None => control_open = false,
                        }
                        continue;
                    }
                    inbound = read.next() => match inbound {
                        Some(Ok(Message::Text(text))) => Bytes::copy_from_slice(text.as_bytes()),
                        Some(Ok(Message::Binary(bin))) => Bytes::from(bin),
                        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                        Some(Ok(Message::Close(frame))) => {
                            info!(?frame, "server closed the stream");
                            return Err(Error::Transport("connection closed by server".into()));
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(Error::Transport("connection closed".into())),
                    },
                };

                // Blocking here when the pipe is full is the backpressure
                // path from the decoder back to the transport.
                tokio::select! {
                    _ = reader_cancel.cancelled() => {
                        let _ = write.close().await;
                        return Ok(());
                    }
                    res = frame_tx.send(frame) => {
                        if res.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        };

        let dispatcher = async {
            let gate = Arc::new(Semaphore::new(self.config.worker_concurrency));
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    frame = frame_rx.recv() => match frame {
                        Some(frame) => frame,
                        // Reader gone; its own result carries the reason.
                        None => return Ok(()),
                    },
                };

                for decoded in decode_frame(&frame) {
                    let envelope = match decoded {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            warn!(error = %e, "skipping undecodable envelope");
                            continue;
                        }
                    };

                    self.received.fetch_add(1, Ordering::Relaxed);
                    // Reconnects may replay already-seen events; the cursor
                    // never regresses within a session.
                    self.cursor.fetch_max(envelope.time_us, Ordering::AcqRel);

                    let permit = tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        permit = gate.clone().acquire_owned() => permit
                            .map_err(|_| Error::Transport("worker gate closed".into()))?,
                    };
                    let sink = self.sink.clone();
                    tracker.spawn(async move {
                        if let Err(e) = sink.handle(envelope).await {
                            warn!(error = %e, "event sink failed");
                        }
                        drop(permit);
                    });
                }
            }
        };

        let checkpointer = async {
            let mut ticker = interval(self.config.checkpoint_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = ticker.tick() => {}
                }

                let received = self.received.swap(0, Ordering::Relaxed);
                trace!(
                    rate = received as f64 / self.config.checkpoint_interval.as_secs_f64(),
                    workers = tracker.len(),
                    "ingest heartbeat"
                );

                let cursor = self.cursor.load(Ordering::Acquire);
                if cursor != 0 {
                    // Fire-and-forget relative to the read path; a failed
                    // flush costs replay, not correctness.
                    if let Err(e) = self.store.put_u64(&self.config.cursor_key, cursor).await {
                        warn!(error = %e, "failed to persist cursor");
                    }
                }
            }
        };

        // The reader finishing (even with a transport error) closes the
        // frame pipe; the dispatcher drains what was already buffered
        // before the session settles. The checkpointer only ever ends on
        // cancellation.
        let ingest = async {
            let (transport, dispatch) = tokio::join!(reader, dispatcher);
            transport.and(dispatch)
        };
        tokio::select! {
            res = ingest => res,
            res = checkpointer => res,
        }
    }

    /// Request URL for this session: endpoint + handshake flag + resume
    /// cursor. The server replays events strictly after `cursor`.
    fn session_url(&self) -> String {
        let mut query = Vec::new();
        if self.config.require_hello {
            query.push("requireHello=true".to_string());
        }
        let cursor = self.cursor.load(Ordering::Acquire);
        if cursor != 0 {
            query.push(format!("cursor={cursor}"));
        }

        if query.is_empty() {
            self.config.endpoint.clone()
        } else {
            format!("{}?{}", self.config.endpoint, query.join("&"))
        }
    }
}

fn endpoint_host_port(endpoint: &str) -> Result<(String, u16)> {
    let uri: Uri = endpoint
        .parse()
        .map_err(|e| Error::Handshake(format!("invalid endpoint {endpoint}: {e}")))?;
    let host = uri
        .host()
        .ok_or_else(|| Error::Handshake(format!("endpoint {endpoint} has no host")))?
        .to_string();
    let tls = matches!(uri.scheme_str(), Some("wss") | Some("https"));
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
    Ok((host, port))
}
