//! Firehose session configuration.

use jetflow_net::RacerConfig;
use std::time::Duration;

/// Configuration for a firehose session.
#[derive(Debug, Clone)]
pub struct FirehoseConfig {
    /// WebSocket endpoint, e.g. `wss://jetstream2.us-east.bsky.network/subscribe`.
    pub endpoint: String,
    /// Ask the server to hold events until the subscriber says hello.
    pub require_hello: bool,
    /// Concurrent worker slots; saturating them backpressures the read loop.
    pub worker_concurrency: usize,
    /// How often the in-memory cursor is flushed to the shared store.
    pub checkpoint_interval: Duration,
    /// Depth of the frame pipe between the socket reader and the decoder.
    pub frame_pipe_depth: usize,
    /// Store key the cursor is checkpointed under.
    pub cursor_key: String,
    /// Outbound connection racing options.
    pub racer: RacerConfig,
}

impl Default for FirehoseConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://jetstream2.us-east.bsky.network/subscribe".to_string(),
            require_hello: true,
            worker_concurrency: 16,
            checkpoint_interval: Duration::from_secs(3),
            frame_pipe_depth: 64,
            cursor_key: "firehose-cursor".to_string(),
            racer: RacerConfig::default(),
        }
    }
}

impl FirehoseConfig {
    pub fn builder() -> FirehoseConfigBuilder {
        FirehoseConfigBuilder::default()
    }
}

/// Builder for [`FirehoseConfig`].
#[derive(Default)]
pub struct FirehoseConfigBuilder {
    config: FirehoseConfig,
}

impl FirehoseConfigBuilder {
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    pub fn require_hello(mut self, require_hello: bool) -> Self {
        self.config.require_hello = require_hello;
        self
    }

    pub fn worker_concurrency(mut self, concurrency: usize) -> Self {
        self.config.worker_concurrency = concurrency.max(1);
        self
    }

    pub fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.config.checkpoint_interval = interval;
        self
    }

    pub fn frame_pipe_depth(mut self, depth: usize) -> Self {
        self.config.frame_pipe_depth = depth.max(1);
        self
    }

    pub fn cursor_key(mut self, key: impl Into<String>) -> Self {
        self.config.cursor_key = key.into();
        self
    }

    pub fn racer(mut self, racer: RacerConfig) -> Self {
        self.config.racer = racer;
        self
    }

    pub fn build(self) -> FirehoseConfig {
        self.config
    }
}
