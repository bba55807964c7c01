//! # PointSync Protocol
//!
//! Data model and wire frames for PointSync.
//!
//! This crate provides:
//! - `EntityKey`, `CounterValue` and `Timestamp` for tracked counters
//! - `ChangeEvent` for authoritative "value as of time" notifications
//! - `Snapshot` for one-shot baseline reads
//! - Wire messages (snapshot request/response, feed request, feed frames)
//! - CBOR encoding/decoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod event;
mod messages;
mod types;

pub use error::{ProtocolError, ProtocolResult};
pub use event::{ChangeEvent, Snapshot};
pub use messages::{
    FeedFrame, FeedRequest, MessageKind, SnapshotRequest, SnapshotResponse, PROTOCOL_VERSION,
};
pub use types::{CounterValue, EntityKey, KeyFilter, Timestamp};
