//! # PointSync Engine
//!
//! Eventually-consistent counter synchronizer for PointSync.
//!
//! This crate provides:
//! - A process-wide registry of per-key counter state (`Synchronizer`)
//! - Subscription handles with poll (`read`) and push (`changed`, `updates`) access
//! - A subscription manager multiplexing one change stream across all keys
//! - Reconnect with exponential backoff and re-snapshot after every outage
//! - Snapshot fetcher and change stream abstractions, with mocks
//! - A CBOR-framed wire transport
//!
//! ## Architecture
//!
//! A key's value is seeded from a one-shot snapshot and then kept current by
//! change events. Every value carries a timestamp and only strictly newer
//! values replace older ones:
//! 1. The first subscriber creates the key's state and events start buffering
//! 2. The manager adds the key to the stream filter
//! 3. The snapshot is fetched and merged with anything buffered, newest wins
//! 4. Later events apply directly; stale ones are dropped
//!
//! ## Key Invariants
//!
//! - Exactly one state per watched key, destroyed with its last subscriber
//! - Observers never see an older timestamp after a newer one
//! - Only the subscription manager opens or closes the change stream
//! - After a reconnect every watched key is re-fetched before new events apply
//! - Unsubscribing is idempotent, and dropping a handle unsubscribes

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
mod error;
mod fetcher;
mod framed;
mod handle;
mod manager;
mod registry;
mod state;
mod synchronizer;
mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RetryConfig, SyncConfig};
pub use error::{FetchError, StreamError, SyncError, SyncResult};
pub use fetcher::{MockFetcher, SnapshotFetcher};
pub use framed::{FrameClient, FrameFeed, FramedTransport, LoopbackClient, LoopbackServer};
pub use handle::SubscriptionHandle;
pub use registry::ApplyOutcome;
pub use state::{Observed, SyncState, SyncStats};
pub use synchronizer::Synchronizer;
pub use transport::{ChangeStream, ChangeStreamTransport, MockStreamTransport, StreamId};

pub use pointsync_protocol::{ChangeEvent, CounterValue, EntityKey, KeyFilter, Snapshot, Timestamp};
