//! End-to-end session tests against an in-process WebSocket server.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use jetflow_core::{MemoryStore, SharedStore, SharedStoreRef};
use jetflow_firehose::{
    Envelope, EventSink, FirehoseClient, FirehoseConfig, SubscriberMessage, SubscriberOptions,
    Supervisor,
};
use jetflow_net::RacerConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(10);

/// Sink that forwards every envelope to the test.
struct ChannelSink(mpsc::UnboundedSender<Envelope>);

#[async_trait]
impl EventSink for ChannelSink {
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()> {
        self.0.send(envelope).ok();
        Ok(())
    }
}

/// Sink that forwards, then fails.
struct FailingSink(mpsc::UnboundedSender<Envelope>);

#[async_trait]
impl EventSink for FailingSink {
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()> {
        self.0.send(envelope).ok();
        anyhow::bail!("sink rejected the event")
    }
}

fn test_config(port: u16) -> FirehoseConfig {
    FirehoseConfig::builder()
        .endpoint(format!("ws://127.0.0.1:{port}/subscribe"))
        .worker_concurrency(1)
        .checkpoint_interval(Duration::from_millis(50))
        .racer(RacerConfig::default().allow_local(true))
        .build()
}

fn envelope_json(did: &str, time_us: u64) -> String {
    format!(r#"{{"did":"{did}","time_us":{time_us},"kind":"test"}}"#)
}

async fn accept_ws(
    listener: &TcpListener,
    uri_tx: mpsc::UnboundedSender<String>,
) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.unwrap();
    accept_hdr_async(stream, move |req: &Request, resp: Response| {
        uri_tx.send(req.uri().to_string()).ok();
        Ok(resp)
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn session_ingests_skips_bad_envelopes_and_checkpoints() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (uri_tx, _uri_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut ws = accept_ws(&listener, uri_tx).await;
        // Envelope 3 of 5 is schema-invalid; 10, 20, 30, 7 must all arrive.
        for frame in [
            envelope_json("did:plc:a", 10),
            envelope_json("did:plc:b", 20),
            r#"{"did":"did:plc:x","time_us":25,"kind":"commit","commit":5}"#.to_string(),
            envelope_json("did:plc:c", 30),
            envelope_json("did:plc:d", 7),
        ] {
            ws.send(Message::text(frame)).await.unwrap();
        }
        // Keep the socket open until the client hangs up.
        while ws.next().await.is_some() {}
    });

    let store: SharedStoreRef = Arc::new(MemoryStore::new());
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let client = Arc::new(FirehoseClient::new(
        test_config(port),
        store.clone(),
        Arc::new(ChannelSink(events_tx)),
    ));

    let cancel = CancellationToken::new();
    let session = tokio::spawn({
        let client = client.clone();
        let cancel = cancel.clone();
        async move { client.listen(None, None, cancel).await }
    });

    let mut seen = Vec::new();
    for _ in 0..4 {
        let envelope = timeout(WAIT, events_rx.recv()).await.unwrap().unwrap();
        seen.push(envelope.time_us);
    }
    // Dispatch order is decode order; the malformed envelope is skipped.
    assert_eq!(seen, vec![10, 20, 30, 7]);

    // In-memory cursor is the max timestamp; the late replay (7) did not
    // regress it.
    assert_eq!(client.cursor(), 30);

    // The checkpoint timer flushes without waiting for teardown.
    timeout(WAIT, async {
        while store.get_u64("firehose-cursor").await.unwrap() != Some(30) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    cancel.cancel();
    let result = timeout(WAIT, session).await.unwrap().unwrap();
    assert!(result.is_ok(), "cancellation must be a clean stop: {result:?}");
    assert_eq!(store.get_u64("firehose-cursor").await.unwrap(), Some(30));
}

#[tokio::test]
async fn resume_requests_events_after_the_cursor() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (uri_tx, mut uri_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut ws = accept_ws(&listener, uri_tx).await;
        // Replay of an event at or before the cursor is legitimate.
        ws.send(Message::text(envelope_json("did:plc:a", 100)))
            .await
            .unwrap();
        while ws.next().await.is_some() {}
    });

    let store: SharedStoreRef = Arc::new(MemoryStore::new());
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let client = Arc::new(FirehoseClient::new(
        test_config(port),
        store,
        Arc::new(ChannelSink(events_tx)),
    ));

    let cancel = CancellationToken::new();
    let session = tokio::spawn({
        let client = client.clone();
        let cancel = cancel.clone();
        async move { client.listen(Some(1234), None, cancel).await }
    });

    let uri = timeout(WAIT, uri_rx.recv()).await.unwrap().unwrap();
    assert!(uri.contains("cursor=1234"), "resume uri was {uri}");
    assert!(uri.contains("requireHello=true"), "uri was {uri}");

    let replayed = timeout(WAIT, events_rx.recv()).await.unwrap().unwrap();
    assert_eq!(replayed.time_us, 100);
    assert_eq!(client.cursor(), 1234, "replay must not regress the cursor");

    cancel.cancel();
    timeout(WAIT, session).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn connect_hook_sends_the_initial_options_update() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (uri_tx, _uri_rx) = mpsc::unbounded_channel();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        let mut ws = accept_ws(&listener, uri_tx).await;
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                frame_tx.send(text.to_string()).ok();
            }
        }
    });

    let store: SharedStoreRef = Arc::new(MemoryStore::new());
    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let client = Arc::new(FirehoseClient::new(
        test_config(port),
        store,
        Arc::new(ChannelSink(events_tx)),
    ));

    let handle = client.handle();
    let hook = Arc::new(move || {
        let handle = handle.clone();
        Box::pin(async move {
            handle
                .send(SubscriberMessage::options(SubscriberOptions {
                    wanted_collections: vec!["app.bsky.feed.post".into()],
                    wanted_dids: vec![],
                    max_message_size_bytes: 8192,
                }))
                .await?;
            Ok(())
        }) as futures::future::BoxFuture<'static, anyhow::Result<()>>
    });

    let cancel = CancellationToken::new();
    let session = tokio::spawn({
        let client = client.clone();
        let cancel = cancel.clone();
        async move { client.listen(None, Some(hook), cancel).await }
    });

    let frame = timeout(WAIT, frame_rx.recv()).await.unwrap().unwrap();
    let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(json["type"], "options_update");
    assert_eq!(json["payload"]["wantedCollections"][0], "app.bsky.feed.post");
    assert_eq!(json["payload"]["maxMessageSizeBytes"], 8192);

    cancel.cancel();
    timeout(WAIT, session).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn sink_failures_do_not_terminate_the_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (uri_tx, _uri_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut ws = accept_ws(&listener, uri_tx).await;
        ws.send(Message::text(envelope_json("did:plc:a", 1)))
            .await
            .unwrap();
        ws.send(Message::text(envelope_json("did:plc:b", 2)))
            .await
            .unwrap();
        while ws.next().await.is_some() {}
    });

    let store: SharedStoreRef = Arc::new(MemoryStore::new());
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let client = Arc::new(FirehoseClient::new(
        test_config(port),
        store,
        Arc::new(FailingSink(events_tx)),
    ));

    let cancel = CancellationToken::new();
    let session = tokio::spawn({
        let client = client.clone();
        let cancel = cancel.clone();
        async move { client.listen(None, None, cancel).await }
    });

    // Both envelopes reach the sink even though every worker fails.
    assert_eq!(
        timeout(WAIT, events_rx.recv()).await.unwrap().unwrap().time_us,
        1
    );
    assert_eq!(
        timeout(WAIT, events_rx.recv()).await.unwrap().unwrap().time_us,
        2
    );

    cancel.cancel();
    let result = timeout(WAIT, session).await.unwrap().unwrap();
    assert!(result.is_ok(), "worker errors must stay in the worker: {result:?}");
}

#[tokio::test]
async fn supervisor_reconnects_from_the_in_memory_cursor() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (uri_tx, mut uri_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        // First session: one envelope, then drop the connection.
        {
            let mut ws = accept_ws(&listener, uri_tx.clone()).await;
            ws.send(Message::text(envelope_json("did:plc:a", 555)))
                .await
                .unwrap();
        }
        // Second session: stay open until the supervisor is cancelled.
        let mut ws = accept_ws(&listener, uri_tx.clone()).await;
        while ws.next().await.is_some() {}
    });

    let store: SharedStoreRef = Arc::new(MemoryStore::new());
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let supervisor = Supervisor::new(
        test_config(port),
        store,
        Arc::new(ChannelSink(events_tx)),
    );

    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let cancel = cancel.clone();
        async move { supervisor.run(cancel).await }
    });

    let first_uri = timeout(WAIT, uri_rx.recv()).await.unwrap().unwrap();
    assert!(!first_uri.contains("cursor="), "fresh start, uri was {first_uri}");

    assert_eq!(
        timeout(WAIT, events_rx.recv()).await.unwrap().unwrap().time_us,
        555
    );

    // The dropped connection is a transport failure; the supervisor
    // reconnects immediately, resuming after the observed cursor.
    let second_uri = timeout(WAIT, uri_rx.recv()).await.unwrap().unwrap();
    assert!(second_uri.contains("cursor=555"), "resume uri was {second_uri}");

    cancel.cancel();
    timeout(WAIT, run).await.unwrap().unwrap();
}
