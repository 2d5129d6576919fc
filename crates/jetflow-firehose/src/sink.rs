//! The worker sink boundary.

use crate::event::{Envelope, EventKind};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Receives one decoded envelope per call.
///
/// Delivery is at-least-once: a reconnect can replay events already seen
/// before the last checkpoint, so implementations must be idempotent.
/// A returned error is logged by the dispatcher and never propagates as a
/// transport failure.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()>;
}

/// Shared sink handle.
pub type SinkRef = Arc<dyn EventSink>;

/// Sink that logs each envelope; the daemon's default.
#[derive(Debug, Default)]
pub struct LoggingSink;

#[async_trait]
impl EventSink for LoggingSink {
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()> {
        let kind = match &envelope.kind {
            EventKind::Commit(c) => format!("commit/{}", c.collection),
            EventKind::Identity(_) => "identity".to_string(),
            EventKind::Account(_) => "account".to_string(),
            EventKind::Unknown(tag) => format!("unknown/{tag}"),
        };
        debug!(did = %envelope.did, time_us = envelope.time_us, %kind, "event");
        Ok(())
    }
}
