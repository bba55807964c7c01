//! Per-key state views and synchronizer statistics.

use pointsync_protocol::{CounterValue, Timestamp};
use std::sync::atomic::{AtomicU64, Ordering};

/// A value as seen by observers of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Observed {
    /// The counter value.
    pub value: CounterValue,
    /// Timestamp of the snapshot or event the value came from.
    pub timestamp: Timestamp,
}

impl Observed {
    /// Creates an observation.
    pub fn new(value: CounterValue, timestamp: Timestamp) -> Self {
        Self { value, timestamp }
    }
}

/// Point-in-time copy of the reconciled state for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncState {
    /// Current counter value.
    pub value: CounterValue,
    /// Timestamp of the last applied snapshot or event.
    pub last_applied: Timestamp,
    /// Number of live subscription handles.
    pub subscriber_count: usize,
    /// Whether the change stream currently delivers events for this key.
    pub stream_connected: bool,
    /// False while the initial snapshot is still in flight.
    pub ready: bool,
}

/// Statistics about synchronizer activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Events that changed a value.
    pub events_applied: u64,
    /// Events dropped because a newer value was already applied.
    pub stale_dropped: u64,
    /// Events dropped because nobody watches the key.
    pub orphan_dropped: u64,
    /// Events held back while a key was initializing.
    pub events_buffered: u64,
    /// Initial snapshots fetched successfully.
    pub snapshots_fetched: u64,
    /// Initial snapshots that failed.
    pub fetch_failures: u64,
    /// Keys re-snapshotted after a reconnect.
    pub resyncs: u64,
    /// Successful stream reconnects.
    pub reconnects: u64,
    /// Streams opened, including refilters.
    pub streams_opened: u64,
}

/// Lock-free counters behind [`SyncStats`].
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    events_applied: AtomicU64,
    stale_dropped: AtomicU64,
    orphan_dropped: AtomicU64,
    events_buffered: AtomicU64,
    snapshots_fetched: AtomicU64,
    fetch_failures: AtomicU64,
    resyncs: AtomicU64,
    reconnects: AtomicU64,
    streams_opened: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn event_applied(&self) {
        self.events_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stale_dropped(&self) {
        self.stale_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn orphan_dropped(&self) {
        self.orphan_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn event_buffered(&self) {
        self.events_buffered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot_fetched(&self) {
        self.snapshots_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fetch_failed(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn resynced(&self) {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reconnected(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stream_opened(&self) {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SyncStats {
        SyncStats {
            events_applied: self.events_applied.load(Ordering::Relaxed),
            stale_dropped: self.stale_dropped.load(Ordering::Relaxed),
            orphan_dropped: self.orphan_dropped.load(Ordering::Relaxed),
            events_buffered: self.events_buffered.load(Ordering::Relaxed),
            snapshots_fetched: self.snapshots_fetched.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
        }
    }
}
