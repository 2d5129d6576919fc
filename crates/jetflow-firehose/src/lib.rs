//! Firehose ingestion for jetflow.
//!
//! A [`Supervisor`] runs [`FirehoseClient`] sessions forever: each session
//! connects over a raced, policy-filtered socket (`jetflow-net`), decodes
//! the envelope stream, dispatches to a bounded worker pool behind a
//! pluggable [`EventSink`], and checkpoints its cursor to a shared store
//! (`jetflow-core`) so the next session resumes where this one stopped.

pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod event;
pub mod sink;
pub mod supervisor;

pub use client::{ConnectHook, FirehoseClient, FirehoseHandle};
pub use config::{FirehoseConfig, FirehoseConfigBuilder};
pub use control::{SubscriberMessage, SubscriberOptions};
pub use error::{Error, Result};
pub use event::{
    decode_frame, Account, Commit, CommitOp, Envelope, EventKind, Identity, RecordPayload,
};
pub use sink::{EventSink, LoggingSink, SinkRef};
pub use supervisor::{SessionHook, Supervisor};
