//! Subscriber-sourced control frames.

use serde::Serialize;

/// A control frame sent from the subscriber to the firehose.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriberMessage {
    /// Replace the server-side subscription options.
    OptionsUpdate { payload: SubscriberOptions },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SubscriberOptions {
    /// Record collections to receive commits for; empty = all.
    #[serde(rename = "wantedCollections")]
    pub wanted_collections: Vec<String>,
    /// Actors to receive events for; empty = all.
    #[serde(rename = "wantedDids")]
    pub wanted_dids: Vec<String>,
    /// Largest frame the subscriber is willing to receive.
    #[serde(rename = "maxMessageSizeBytes")]
    pub max_message_size_bytes: u64,
}

impl SubscriberMessage {
    pub fn options(payload: SubscriberOptions) -> Self {
        Self::OptionsUpdate { payload }
    }
}
