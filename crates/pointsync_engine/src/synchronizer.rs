//! The synchronizer facade.

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::error::{FetchError, SyncError, SyncResult};
use crate::fetcher::SnapshotFetcher;
use crate::handle::{Shared, SubscriptionHandle};
use crate::manager::{SubscriptionManager, WatchAck};
use crate::registry::{Acquired, ApplyOutcome, KeySlot, Registry};
use crate::state::{SyncState, SyncStats};
use crate::transport::ChangeStreamTransport;
use pointsync_protocol::{ChangeEvent, CounterValue, EntityKey, KeyFilter, Snapshot, Timestamp};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Keeps locally cached counters consistent with a remote store.
///
/// Each subscribed key is seeded from a snapshot and then kept current by
/// a single shared change stream. Values only ever move forward in
/// timestamp order.
///
/// # Example
///
/// ```rust,ignore
/// use pointsync_engine::{MockFetcher, MockStreamTransport, SyncConfig, Synchronizer};
///
/// let sync = Synchronizer::new(fetcher, transport, SyncConfig::default());
/// let mut handle = sync.subscribe("user-1").await?;
/// println!("points: {}", handle.read());
/// while let Some(observed) = handle.changed().await {
///     println!("points: {}", observed.value);
/// }
/// ```
pub struct Synchronizer<F, T> {
    fetcher: Arc<F>,
    transport: Arc<T>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    shared: Arc<Shared>,
}

impl<F, T> Synchronizer<F, T>
where
    F: SnapshotFetcher,
    T: ChangeStreamTransport,
{
    /// Creates a synchronizer and starts its subscription manager.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(fetcher: F, transport: T, config: SyncConfig) -> Self {
        Self::with_clock(fetcher, transport, config, Arc::new(SystemClock))
    }

    /// Creates a synchronizer that stamps untimed snapshots with `clock`.
    pub fn with_clock(fetcher: F, transport: T, config: SyncConfig, clock: Arc<dyn Clock>) -> Self {
        let fetcher = Arc::new(fetcher);
        let transport = Arc::new(transport);
        let registry = Arc::new(Registry::new());
        let manager = SubscriptionManager::spawn(
            Arc::clone(&fetcher),
            Arc::clone(&transport),
            Arc::clone(&registry),
            Arc::clone(&clock),
            config.clone(),
        );
        info!("synchronizer started");

        Self {
            fetcher,
            transport,
            clock,
            config,
            shared: Arc::new(Shared { registry, manager }),
        }
    }

    /// Subscribes to `key`, waiting for its initial value.
    ///
    /// The first subscriber for a key starts the snapshot fetch; every
    /// subscriber, first or later, shares the same state and waits until it
    /// is ready. A failed snapshot is reported to every waiting subscriber
    /// and leaves no state behind. Dropping the returned future releases only
    /// this subscription; the fetch keeps going while anyone else waits.
    pub async fn subscribe(&self, key: impl Into<EntityKey>) -> SyncResult<SubscriptionHandle> {
        let key = key.into();
        if key.is_empty() {
            return Err(SyncError::EmptyKey);
        }

        let slot = match self.shared.registry.acquire(&key)? {
            Acquired::Joined(slot) => slot,
            Acquired::Created(slot) => {
                self.start_initialization(&slot)?;
                slot
            }
        };

        let guard = PendingRelease::new(&self.shared, Arc::clone(&slot));
        slot.wait_ready().await?;
        let observed = slot.observe().ok_or(SyncError::Cancelled)?;
        guard.disarm();
        Ok(SubscriptionHandle::new(key, Arc::clone(&self.shared), slot, observed))
    }

    /// Watches the key and spawns its initial snapshot fetch.
    ///
    /// The watch request is queued before this returns, so any later unwatch
    /// for the key is ordered after it.
    fn start_initialization(&self, slot: &Arc<KeySlot>) -> SyncResult<()> {
        let ack = match self.shared.manager.request_watch(slot.key().clone()) {
            Ok(ack) => ack,
            Err(e) => {
                self.shared.registry.abandon_initial(slot);
                return Err(e);
            }
        };

        tokio::spawn(initialize(
            Arc::clone(&self.fetcher),
            Arc::clone(&self.clock),
            self.config.fetch_timeout,
            Arc::clone(&self.shared),
            Arc::clone(slot),
            ack,
        ));
        Ok(())
    }
}

/// Fetches the initial snapshot for a freshly created slot and resolves it.
///
/// Runs detached from any subscriber, so the outcome reaches every waiter
/// even if the subscriber that created the slot went away.
async fn initialize<F: SnapshotFetcher>(
    fetcher: Arc<F>,
    clock: Arc<dyn Clock>,
    fetch_timeout: Duration,
    shared: Arc<Shared>,
    slot: Arc<KeySlot>,
    ack: oneshot::Receiver<WatchAck>,
) {
    let key = slot.key().clone();
    let Ok(ack) = ack.await else {
        debug!(key = %key, "manager stopped before the key was watched");
        shared.registry.abandon_initial(&slot);
        return;
    };
    debug!(key = %key, live = ack == WatchAck::Live, "key watched");

    let fetched_at = clock.now();
    let result = timeout(fetch_timeout, fetcher.fetch_snapshot(&key))
        .await
        .unwrap_or(Err(FetchError::Timeout));

    let snapshot = match result {
        Ok(snapshot) => snapshot,
        Err(FetchError::NotFound) => Snapshot::new(0, Timestamp::ZERO),
        Err(error) => {
            shared.registry.counters().fetch_failed();
            warn!(key = %key, error = %error, "initial snapshot failed");
            if shared.registry.fail_initial(&slot, error) {
                shared.manager.unwatch(key);
            }
            return;
        }
    };
    shared.registry.counters().snapshot_fetched();

    if shared
        .registry
        .resolve_initial(&slot, snapshot.value, snapshot.basis(fetched_at))
        .is_err()
    {
        trace!(key = %key, "every subscriber left before the snapshot arrived");
    }
}

impl<F, T> Synchronizer<F, T> {
    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the snapshot fetcher.
    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Returns the change stream transport.
    ///
    /// The stream itself is owned by the subscription manager; this is for
    /// inspection only.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns the handle's current value. Never blocks.
    pub fn read(&self, handle: &SubscriptionHandle) -> CounterValue {
        handle.read()
    }

    /// Releases `handle`. Idempotent.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        handle.unsubscribe();
    }

    /// Applies an event delivered outside the managed stream.
    pub fn apply_event(&self, event: ChangeEvent) -> ApplyOutcome {
        self.shared.registry.apply_event(event)
    }

    /// Returns a copy of the state for `key`, if anyone is subscribed.
    pub fn state(&self, key: &EntityKey) -> Option<SyncState> {
        self.shared.registry.state(key)
    }

    /// Returns the number of keys with live state.
    pub fn active_keys(&self) -> usize {
        self.shared.registry.len()
    }

    /// Returns the keys the change stream is filtered to.
    pub fn watched_keys(&self) -> KeyFilter {
        self.shared.manager.watched_keys()
    }

    /// Returns true while the change stream is open and pumping events.
    pub fn is_stream_connected(&self) -> bool {
        self.shared.manager.is_connected()
    }

    /// Returns activity counters.
    pub fn stats(&self) -> SyncStats {
        self.shared.registry.stats()
    }

    /// Destroys every state and closes the change stream.
    ///
    /// Outstanding handles stop updating and in-flight subscribes fail with
    /// [`SyncError::Cancelled`]; later subscribes fail with
    /// [`SyncError::Shutdown`].
    pub async fn teardown(&self) {
        let closed = self.shared.registry.close_all();
        self.shared.manager.shutdown().await;
        info!(closed, "synchronizer torn down");
    }
}

impl<F, T> Drop for Synchronizer<F, T> {
    fn drop(&mut self) {
        if !self.shared.registry.is_shut_down() {
            self.shared.registry.close_all();
            self.shared.manager.shutdown_now();
        }
    }
}

/// Gives back one subscriber slot if a subscribe does not complete.
struct PendingRelease<'a> {
    shared: &'a Shared,
    slot: Arc<KeySlot>,
    armed: bool,
}

impl<'a> PendingRelease<'a> {
    fn new(shared: &'a Shared, slot: Arc<KeySlot>) -> Self {
        Self {
            shared,
            slot,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingRelease<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.release(&self.slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fetcher::MockFetcher;
    use crate::transport::MockStreamTransport;

    type MockSync = Synchronizer<Arc<MockFetcher>, Arc<MockStreamTransport>>;

    fn setup() -> (MockSync, Arc<MockFetcher>, Arc<MockStreamTransport>) {
        let fetcher = Arc::new(MockFetcher::new());
        let transport = Arc::new(MockStreamTransport::new());
        let sync = Synchronizer::new(
            Arc::clone(&fetcher),
            Arc::clone(&transport),
            SyncConfig::default(),
        );
        (sync, fetcher, transport)
    }

    #[tokio::test]
    async fn subscribe_seeds_from_snapshot() {
        let (sync, fetcher, transport) = setup();
        fetcher.set("user-1", Snapshot::new(42, 100));

        let handle = sync.subscribe("user-1").await.unwrap();
        assert_eq!(handle.read(), 42);
        assert_eq!(sync.read(&handle), 42);

        let state = sync.state(handle.key()).unwrap();
        assert_eq!(state.last_applied, Timestamp::from_millis(100));
        assert_eq!(state.subscriber_count, 1);
        assert!(state.stream_connected);
        assert!(state.ready);
        assert_eq!(transport.live_filters().len(), 1);
    }

    #[tokio::test]
    async fn missing_record_reads_as_zero_and_any_event_wins() {
        let (sync, _fetcher, _transport) = setup();

        let handle = sync.subscribe("new-user").await.unwrap();
        assert_eq!(handle.read(), 0);

        assert_eq!(
            sync.apply_event(ChangeEvent::new("new-user", 5, 1)),
            ApplyOutcome::Applied
        );
        assert_eq!(handle.read(), 5);
    }

    #[tokio::test]
    async fn untimed_snapshot_uses_fetch_time() {
        let fetcher = Arc::new(MockFetcher::new());
        let clock = Arc::new(ManualClock::new(1_000));
        fetcher.set("k", Snapshot::untimed(3));
        let sync = Synchronizer::with_clock(
            Arc::clone(&fetcher),
            MockStreamTransport::new(),
            SyncConfig::default(),
            clock,
        );

        let handle = sync.subscribe("k").await.unwrap();
        assert_eq!(handle.observed().timestamp, Timestamp::from_millis(1_000));
        assert_eq!(
            sync.apply_event(ChangeEvent::new("k", 4, 999)),
            ApplyOutcome::Stale
        );
        assert_eq!(
            sync.apply_event(ChangeEvent::new("k", 4, 1_001)),
            ApplyOutcome::Applied
        );
    }

    #[tokio::test]
    async fn empty_key_is_rejected() {
        let (sync, _fetcher, _transport) = setup();
        assert!(matches!(
            sync.subscribe("").await,
            Err(SyncError::EmptyKey)
        ));
    }

    #[tokio::test]
    async fn transient_failure_is_surfaced_and_leaves_nothing() {
        let (sync, fetcher, _transport) = setup();
        fetcher.fail_next("k", FetchError::transient("reset"));

        let err = sync.subscribe("k").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(sync.state(&EntityKey::from("k")).is_none());
        assert_eq!(sync.stats().fetch_failures, 1);

        // Retrying succeeds once the store recovers.
        fetcher.set("k", Snapshot::new(1, 1));
        assert_eq!(sync.subscribe("k").await.unwrap().read(), 1);
    }

    #[tokio::test]
    async fn fetch_timeout_is_transient() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.set_delay(Duration::from_secs(5));
        let sync = Synchronizer::new(
            Arc::clone(&fetcher),
            MockStreamTransport::new(),
            SyncConfig::default().with_fetch_timeout(Duration::from_millis(20)),
        );

        assert_eq!(
            sync.subscribe("k").await.unwrap_err(),
            SyncError::Fetch(FetchError::Timeout)
        );
    }

    #[tokio::test]
    async fn second_subscriber_shares_state() {
        let (sync, fetcher, _transport) = setup();
        fetcher.set("k", Snapshot::new(9, 9));

        let first = sync.subscribe("k").await.unwrap();
        let second = sync.subscribe("k").await.unwrap();
        assert_eq!(second.read(), 9);
        assert_eq!(fetcher.calls_for(&EntityKey::from("k")), 1);
        assert_eq!(sync.state(first.key()).unwrap().subscriber_count, 2);

        first.unsubscribe();
        assert_eq!(sync.state(second.key()).unwrap().subscriber_count, 1);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let (sync, fetcher, _transport) = setup();
        fetcher.set("k", Snapshot::new(1, 1));

        let first = sync.subscribe("k").await.unwrap();
        let second = sync.subscribe("k").await.unwrap();

        sync.unsubscribe(&first);
        sync.unsubscribe(&first);
        first.unsubscribe();
        assert_eq!(sync.state(second.key()).unwrap().subscriber_count, 1);
        assert!(!first.is_active());
        assert!(second.is_active());
    }

    #[tokio::test]
    async fn dropping_subscribe_future_releases() {
        let (sync, fetcher, _transport) = setup();
        fetcher.set("k", Snapshot::new(1, 1));
        fetcher.pause();

        let pending = sync.subscribe("k");
        let outcome = tokio::time::timeout(Duration::from_millis(50), pending).await;
        assert!(outcome.is_err());

        assert!(sync.state(&EntityKey::from("k")).is_none());
        fetcher.resume();
    }

    #[tokio::test]
    async fn teardown_closes_everything() {
        let (sync, fetcher, transport) = setup();
        fetcher.set("k", Snapshot::new(1, 1));
        let mut handle = sync.subscribe("k").await.unwrap();

        sync.teardown().await;

        assert_eq!(handle.changed().await, None);
        assert!(!handle.is_active());
        assert_eq!(handle.read(), 1);
        assert!(sync.watched_keys().is_empty());
        assert!(transport.live_filters().is_empty());
        assert!(matches!(
            sync.subscribe("k").await,
            Err(SyncError::Shutdown)
        ));
    }
}
