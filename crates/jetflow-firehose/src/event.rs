//! Firehose envelope model and decoding.
//!
//! The wire format is a concatenated sequence of independently-framed JSON
//! objects (not a JSON array), each discriminated by a `kind` tag, with a
//! nested `operation` tag inside commits. Both discriminators are resolved
//! through an explicit tag lookup: an unrecognized tag falls back to the
//! base shape instead of failing the envelope, and a schema-invalid
//! envelope fails alone without poisoning the rest of its frame.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

/// One decoded unit of the event stream.
///
/// Immutable after decode; ownership transfers to exactly one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Actor identifier.
    pub did: String,
    /// Server-assigned event timestamp, microseconds.
    pub time_us: u64,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Commit(Commit),
    Identity(Identity),
    Account(Account),
    /// Unrecognized (or absent) `kind` tag; base fields only.
    Unknown(String),
}

/// A repository commit: one record created, updated, or deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub rev: String,
    pub collection: String,
    pub rkey: String,
    pub operation: CommitOp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOp {
    Create(RecordPayload),
    Update(RecordPayload),
    Delete,
    /// Unrecognized `operation` tag; commit base fields are still valid.
    Unknown(String),
}

/// Record content for create/update operations.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordPayload {
    /// Opaque record body; interpretation belongs to the sink.
    pub record: Value,
    /// Content hash of the record.
    pub cid: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Identity {
    pub did: String,
    pub handle: String,
    pub seq: u64,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Account {
    pub active: bool,
    pub did: String,
    pub seq: u64,
    pub time: DateTime<Utc>,
}

// Lenient intermediate shapes: tag resolution happens after JSON-level
// deserialization so unknown tags can fall back instead of erroring.

#[derive(Deserialize)]
struct RawEnvelope {
    did: String,
    time_us: u64,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    commit: Option<RawCommit>,
    #[serde(default)]
    identity: Option<Identity>,
    #[serde(default)]
    account: Option<Account>,
}

#[derive(Deserialize)]
struct RawCommit {
    rev: String,
    collection: String,
    rkey: String,
    #[serde(default)]
    operation: Option<String>,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    cid: Option<String>,
}

impl Envelope {
    /// Decode one envelope from a JSON value.
    pub fn from_value(value: Value) -> Result<Self> {
        let raw: RawEnvelope =
            serde_json::from_value(value).map_err(|e| Error::Decode(e.to_string()))?;

        let kind = match raw.kind.as_deref() {
            Some("commit") => {
                let commit = raw
                    .commit
                    .ok_or_else(|| Error::Decode("commit envelope without commit payload".into()))?;
                EventKind::Commit(Commit::from_raw(commit)?)
            }
            Some("identity") => EventKind::Identity(raw.identity.ok_or_else(|| {
                Error::Decode("identity envelope without identity payload".into())
            })?),
            Some("account") => EventKind::Account(raw.account.ok_or_else(|| {
                Error::Decode("account envelope without account payload".into())
            })?),
            other => EventKind::Unknown(other.unwrap_or_default().to_string()),
        };

        Ok(Envelope {
            did: raw.did,
            time_us: raw.time_us,
            kind,
        })
    }
}

impl Commit {
    fn from_raw(raw: RawCommit) -> Result<Self> {
        let operation = match raw.operation.as_deref() {
            Some(op @ ("create" | "update")) => {
                let payload = RecordPayload {
                    record: raw
                        .record
                        .ok_or_else(|| Error::Decode(format!("{op} commit without record")))?,
                    cid: raw
                        .cid
                        .ok_or_else(|| Error::Decode(format!("{op} commit without cid")))?,
                };
                if op == "create" {
                    CommitOp::Create(payload)
                } else {
                    CommitOp::Update(payload)
                }
            }
            Some("delete") => CommitOp::Delete,
            other => CommitOp::Unknown(other.unwrap_or_default().to_string()),
        };

        Ok(Commit {
            rev: raw.rev,
            collection: raw.collection,
            rkey: raw.rkey,
            operation,
        })
    }
}

/// Decode a complete frame holding zero or more concatenated JSON envelopes.
///
/// Yields one result per envelope: a schema-invalid envelope yields a
/// recoverable [`Error::Decode`] and decoding continues with the next
/// object. A JSON syntax error loses sync, so the remainder of the frame is
/// abandoned after one final error item.
pub fn decode_frame(frame: &[u8]) -> impl Iterator<Item = Result<Envelope>> + '_ {
    let mut values = serde_json::Deserializer::from_slice(frame).into_iter::<Value>();
    let mut poisoned = false;
    std::iter::from_fn(move || {
        if poisoned {
            return None;
        }
        match values.next()? {
            Ok(value) => Some(Envelope::from_value(value)),
            Err(e) => {
                poisoned = true;
                Some(Err(Error::Decode(format!("frame corrupted: {e}"))))
            }
        }
    })
}
