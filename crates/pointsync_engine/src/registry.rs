//! Process-wide map from entity key to reconciled state.
//!
//! Lock order is always map first, then slot. The map lock is only held for
//! lookups and for inserting or removing slots; all value mutations happen
//! under the owning slot's mutex, so different keys never contend.

use crate::error::{FetchError, SyncError, SyncResult};
use crate::state::{Observed, StatsCounters, SyncState, SyncStats};
use parking_lot::{Mutex, RwLock};
use pointsync_protocol::{ChangeEvent, CounterValue, EntityKey, Timestamp};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace};

/// What happened to an event handed to the synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The event replaced the current value.
    Applied,
    /// A value at least as new was already applied.
    Stale,
    /// Nobody is subscribed to the key.
    Orphan,
    /// The key is still initializing; the event will be merged with its snapshot.
    Buffered,
}

/// Initialization status of a slot, published to waiting subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SlotStatus {
    Initializing,
    Ready,
    Failed(FetchError),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initializing,
    Ready,
}

struct SlotState {
    phase: Phase,
    value: CounterValue,
    last_applied: Timestamp,
    subscribers: usize,
    stream_connected: bool,
    buffered: Vec<ChangeEvent>,
    closed: bool,
    observers: Option<watch::Sender<Observed>>,
}

impl SlotState {
    fn new() -> Self {
        Self {
            phase: Phase::Initializing,
            value: 0,
            last_applied: Timestamp::ZERO,
            subscribers: 1,
            stream_connected: false,
            buffered: Vec::new(),
            closed: false,
            observers: Some(watch::Sender::new(Observed::default())),
        }
    }

    fn set(&mut self, value: CounterValue, timestamp: Timestamp) {
        self.value = value;
        self.last_applied = timestamp;
        if let Some(observers) = &self.observers {
            observers.send_replace(Observed::new(value, timestamp));
        }
    }
}

/// State of one watched key.
pub(crate) struct KeySlot {
    key: EntityKey,
    state: Mutex<SlotState>,
    status: watch::Sender<SlotStatus>,
}

impl KeySlot {
    fn new(key: EntityKey) -> Self {
        Self {
            key,
            state: Mutex::new(SlotState::new()),
            status: watch::Sender::new(SlotStatus::Initializing),
        }
    }

    pub(crate) fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Waits until the slot has left the initializing phase.
    pub(crate) async fn wait_ready(&self) -> SyncResult<()> {
        let mut status = self.status.subscribe();
        let settled = status
            .wait_for(|s| *s != SlotStatus::Initializing)
            .await
            .map(|s| (*s).clone());
        match settled {
            Ok(SlotStatus::Ready) => Ok(()),
            Ok(SlotStatus::Failed(error)) => Err(SyncError::Fetch(error)),
            Ok(SlotStatus::Initializing) | Ok(SlotStatus::Closed) | Err(_) => {
                Err(SyncError::Cancelled)
            }
        }
    }

    /// Returns a receiver of observed values, or `None` once the slot is closed.
    pub(crate) fn observe(&self) -> Option<watch::Receiver<Observed>> {
        let state = self.state.lock();
        if state.closed {
            return None;
        }
        state.observers.as_ref().map(|tx| tx.subscribe())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn is_stream_connected(&self) -> bool {
        let state = self.state.lock();
        !state.closed && state.stream_connected
    }

    fn view(&self) -> Option<SyncState> {
        let state = self.state.lock();
        if state.closed {
            return None;
        }
        Some(SyncState {
            value: state.value,
            last_applied: state.last_applied,
            subscriber_count: state.subscribers,
            stream_connected: state.stream_connected,
            ready: state.phase == Phase::Ready,
        })
    }

    /// Closes the slot. Must be called with the map write lock held and the
    /// slot already removed from the map.
    fn close(&self, state: &mut SlotState, status: SlotStatus) {
        state.closed = true;
        state.subscribers = 0;
        state.stream_connected = false;
        state.buffered.clear();
        state.observers = None;
        self.status.send_replace(status);
    }
}

/// Result of registering interest in a key.
pub(crate) enum Acquired {
    /// First subscriber; the caller must fetch the snapshot and resolve.
    Created(Arc<KeySlot>),
    /// An existing state was joined.
    Joined(Arc<KeySlot>),
}

/// Result of releasing one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
    /// Other subscribers remain.
    Remaining(usize),
    /// The last subscriber left and the state was destroyed.
    Destroyed,
    /// The state was already gone.
    AlreadyGone,
}

/// The key-to-state registry.
#[derive(Default)]
pub(crate) struct Registry {
    slots: RwLock<HashMap<EntityKey, Arc<KeySlot>>>,
    stats: StatsCounters,
    shut_down: AtomicBool,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn stats(&self) -> SyncStats {
        self.stats.snapshot()
    }

    pub(crate) fn counters(&self) -> &StatsCounters {
        &self.stats
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn slot(&self, key: &EntityKey) -> Option<Arc<KeySlot>> {
        self.slots.read().get(key).cloned()
    }

    /// Registers one more subscriber for `key`, creating its state if needed.
    pub(crate) fn acquire(&self, key: &EntityKey) -> SyncResult<Acquired> {
        if self.is_shut_down() {
            return Err(SyncError::Shutdown);
        }

        if let Some(slot) = self.join(&self.slots.read(), key) {
            return Ok(Acquired::Joined(slot));
        }

        let mut slots = self.slots.write();
        if self.is_shut_down() {
            return Err(SyncError::Shutdown);
        }
        if let Some(slot) = self.join(&slots, key) {
            return Ok(Acquired::Joined(slot));
        }

        let slot = Arc::new(KeySlot::new(key.clone()));
        slots.insert(key.clone(), Arc::clone(&slot));
        debug!(key = %key, "created sync state");
        Ok(Acquired::Created(slot))
    }

    fn join(&self, slots: &HashMap<EntityKey, Arc<KeySlot>>, key: &EntityKey) -> Option<Arc<KeySlot>> {
        let slot = slots.get(key)?;
        let mut state = slot.state.lock();
        if state.closed {
            return None;
        }
        state.subscribers += 1;
        trace!(key = %key, subscribers = state.subscribers, "joined sync state");
        Some(Arc::clone(slot))
    }

    /// Applies a change event under the key's lock.
    pub(crate) fn apply_event(&self, event: ChangeEvent) -> ApplyOutcome {
        let Some(slot) = self.slot(&event.entity_key) else {
            self.stats.orphan_dropped();
            trace!(key = %event.entity_key, ts = %event.source_timestamp, "dropped event for unwatched key");
            return ApplyOutcome::Orphan;
        };

        let mut state = slot.state.lock();
        if state.closed {
            self.stats.orphan_dropped();
            trace!(key = %event.entity_key, "dropped event for closed state");
            return ApplyOutcome::Orphan;
        }

        match state.phase {
            Phase::Initializing => {
                trace!(key = %event.entity_key, ts = %event.source_timestamp, "buffered event during initialization");
                state.buffered.push(event);
                self.stats.event_buffered();
                ApplyOutcome::Buffered
            }
            Phase::Ready if event.supersedes(state.last_applied) => {
                state.set(event.new_value, event.source_timestamp);
                self.stats.event_applied();
                ApplyOutcome::Applied
            }
            Phase::Ready => {
                self.stats.stale_dropped();
                trace!(
                    key = %event.entity_key,
                    ts = %event.source_timestamp,
                    last_applied = %state.last_applied,
                    "dropped stale event"
                );
                ApplyOutcome::Stale
            }
        }
    }

    /// Applies a post-reconnect snapshot as if it were an event at `basis`.
    pub(crate) fn apply_resync(
        &self,
        key: &EntityKey,
        value: CounterValue,
        basis: Timestamp,
    ) -> ApplyOutcome {
        let outcome = self.apply_event(ChangeEvent::new(key.clone(), value, basis));
        if outcome != ApplyOutcome::Orphan {
            self.stats.resynced();
        }
        outcome
    }

    /// Seeds an initializing slot with its snapshot and merges buffered events.
    ///
    /// The newest of the snapshot and the buffered events wins. Fails with
    /// `Cancelled` if the slot was closed while the snapshot was in flight.
    pub(crate) fn resolve_initial(
        &self,
        slot: &KeySlot,
        value: CounterValue,
        basis: Timestamp,
    ) -> SyncResult<Observed> {
        let mut state = slot.state.lock();
        if state.closed {
            debug!(key = %slot.key, "discarding snapshot for closed state");
            return Err(SyncError::Cancelled);
        }

        let mut resolved = Observed::new(value, basis);
        let mut buffered = std::mem::take(&mut state.buffered);
        buffered.sort_by_key(|event| event.source_timestamp);
        for event in buffered {
            if event.supersedes(resolved.timestamp) {
                resolved = Observed::new(event.new_value, event.source_timestamp);
                self.stats.event_applied();
            } else {
                self.stats.stale_dropped();
            }
        }

        state.phase = Phase::Ready;
        state.set(resolved.value, resolved.timestamp);
        slot.status.send_replace(SlotStatus::Ready);
        debug!(
            key = %slot.key,
            value = resolved.value,
            ts = %resolved.timestamp,
            "sync state ready"
        );
        Ok(resolved)
    }

    /// Destroys an initializing slot whose snapshot failed.
    ///
    /// Every waiting subscriber receives the error. Returns true if this call
    /// closed the slot.
    pub(crate) fn fail_initial(&self, slot: &KeySlot, error: FetchError) -> bool {
        self.close_slot(slot, SlotStatus::Failed(error))
    }

    /// Destroys a slot that can no longer be initialized.
    ///
    /// Waiting subscribers are cancelled. Returns true if this call closed
    /// the slot.
    pub(crate) fn abandon_initial(&self, slot: &KeySlot) -> bool {
        self.close_slot(slot, SlotStatus::Closed)
    }

    fn close_slot(&self, slot: &KeySlot, status: SlotStatus) -> bool {
        let mut slots = self.slots.write();
        let mut state = slot.state.lock();
        if state.closed {
            return false;
        }
        remove_if_same(&mut slots, slot);
        slot.close(&mut state, status);
        debug!(key = %slot.key, "destroyed sync state before it became ready");
        true
    }

    /// Drops one subscriber. Destroys the state when none remain.
    pub(crate) fn release(&self, slot: &KeySlot) -> Release {
        let mut slots = self.slots.write();
        let mut state = slot.state.lock();
        if state.closed {
            return Release::AlreadyGone;
        }

        state.subscribers = state.subscribers.saturating_sub(1);
        if state.subscribers > 0 {
            trace!(key = %slot.key, subscribers = state.subscribers, "released subscription");
            return Release::Remaining(state.subscribers);
        }

        remove_if_same(&mut slots, slot);
        slot.close(&mut state, SlotStatus::Closed);
        debug!(key = %slot.key, "destroyed sync state");
        Release::Destroyed
    }

    /// Closes every slot and refuses further subscriptions.
    pub(crate) fn close_all(&self) -> usize {
        let mut slots = self.slots.write();
        self.shut_down.store(true, Ordering::Release);
        let count = slots.len();
        for (_, slot) in slots.drain() {
            let mut state = slot.state.lock();
            slot.close(&mut state, SlotStatus::Closed);
        }
        count
    }

    /// Sets the connected flag for the given keys.
    pub(crate) fn set_connected<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a EntityKey>,
        connected: bool,
    ) {
        let slots = self.slots.read();
        for key in keys {
            if let Some(slot) = slots.get(key) {
                slot.state.lock().stream_connected = connected;
            }
        }
    }

    /// Sets the connected flag for every key.
    pub(crate) fn set_all_connected(&self, connected: bool) {
        let slots = self.slots.read();
        for slot in slots.values() {
            slot.state.lock().stream_connected = connected;
        }
    }

    /// Returns a copy of the state for `key`.
    pub(crate) fn state(&self, key: &EntityKey) -> Option<SyncState> {
        self.slot(key)?.view()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.read().len()
    }

    #[cfg(test)]
    fn hold_slot_lock(&self, key: &EntityKey) -> Option<HeldSlot> {
        self.slot(key).map(HeldSlot::new)
    }
}

fn remove_if_same(slots: &mut HashMap<EntityKey, Arc<KeySlot>>, slot: &KeySlot) {
    if slots
        .get(&slot.key)
        .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), slot))
    {
        slots.remove(&slot.key);
    }
}

#[cfg(test)]
struct HeldSlot {
    slot: Arc<KeySlot>,
}

#[cfg(test)]
impl HeldSlot {
    fn new(slot: Arc<KeySlot>) -> Self {
        Self { slot }
    }

    fn lock(&self) -> parking_lot::MutexGuard<'_, SlotState> {
        self.slot.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn key(s: &str) -> EntityKey {
        EntityKey::from(s)
    }

    fn created(registry: &Registry, k: &str) -> Arc<KeySlot> {
        match registry.acquire(&key(k)).unwrap() {
            Acquired::Created(slot) => slot,
            Acquired::Joined(_) => panic!("expected a new slot"),
        }
    }

    fn ready(registry: &Registry, k: &str, value: CounterValue, ts: u64) -> Arc<KeySlot> {
        let slot = created(registry, k);
        registry
            .resolve_initial(&slot, value, Timestamp::from_millis(ts))
            .unwrap();
        slot
    }

    #[test]
    fn stale_event_is_rejected() {
        let registry = Registry::new();
        ready(&registry, "k", 10, 100);

        assert_eq!(
            registry.apply_event(ChangeEvent::new("k", 99, 90)),
            ApplyOutcome::Stale
        );
        assert_eq!(
            registry.apply_event(ChangeEvent::new("k", 99, 100)),
            ApplyOutcome::Stale
        );

        let state = registry.state(&key("k")).unwrap();
        assert_eq!(state.value, 10);
        assert_eq!(state.last_applied, Timestamp::from_millis(100));
        assert_eq!(registry.stats().stale_dropped, 2);
    }

    #[test]
    fn newer_event_applies_and_notifies() {
        let registry = Registry::new();
        let slot = ready(&registry, "k", 10, 100);
        let mut rx = slot.observe().unwrap();

        assert_eq!(
            registry.apply_event(ChangeEvent::new("k", 15, 110)),
            ApplyOutcome::Applied
        );
        assert!(rx.has_changed().unwrap());
        assert_eq!(
            *rx.borrow_and_update(),
            Observed::new(15, Timestamp::from_millis(110))
        );
    }

    #[test]
    fn orphan_event_is_dropped() {
        let registry = Registry::new();
        assert_eq!(
            registry.apply_event(ChangeEvent::new("nobody", 1, 1)),
            ApplyOutcome::Orphan
        );
        assert!(registry.state(&key("nobody")).is_none());
        assert_eq!(registry.stats().orphan_dropped, 1);
    }

    #[test]
    fn buffered_newer_event_beats_snapshot() {
        let registry = Registry::new();
        let slot = created(&registry, "k");

        assert_eq!(
            registry.apply_event(ChangeEvent::new("k", 7, 20)),
            ApplyOutcome::Buffered
        );
        let resolved = registry
            .resolve_initial(&slot, 5, Timestamp::from_millis(10))
            .unwrap();

        assert_eq!(resolved, Observed::new(7, Timestamp::from_millis(20)));
        assert_eq!(registry.state(&key("k")).unwrap().value, 7);
    }

    #[test]
    fn snapshot_beats_older_buffered_events() {
        let registry = Registry::new();
        let slot = created(&registry, "k");

        registry.apply_event(ChangeEvent::new("k", 3, 5));
        registry.apply_event(ChangeEvent::new("k", 4, 10));
        let resolved = registry
            .resolve_initial(&slot, 5, Timestamp::from_millis(10))
            .unwrap();

        assert_eq!(resolved.value, 5);
        assert_eq!(registry.stats().stale_dropped, 2);
    }

    #[test]
    fn buffered_events_merge_by_timestamp_not_arrival() {
        let registry = Registry::new();
        let slot = created(&registry, "k");

        registry.apply_event(ChangeEvent::new("k", 30, 30));
        registry.apply_event(ChangeEvent::new("k", 20, 20));
        let resolved = registry
            .resolve_initial(&slot, 5, Timestamp::from_millis(10))
            .unwrap();

        assert_eq!(resolved, Observed::new(30, Timestamp::from_millis(30)));
    }

    #[test]
    fn release_counts_down_then_destroys() {
        let registry = Registry::new();
        let slot = ready(&registry, "k", 1, 1);
        assert!(matches!(
            registry.acquire(&key("k")).unwrap(),
            Acquired::Joined(_)
        ));
        assert_eq!(registry.state(&key("k")).unwrap().subscriber_count, 2);

        assert_eq!(registry.release(&slot), Release::Remaining(1));
        assert_eq!(registry.release(&slot), Release::Destroyed);
        assert_eq!(registry.release(&slot), Release::AlreadyGone);
        assert!(registry.state(&key("k")).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn stale_release_does_not_touch_new_state() {
        let registry = Registry::new();
        let old = ready(&registry, "k", 1, 1);
        assert_eq!(registry.release(&old), Release::Destroyed);

        let new = ready(&registry, "k", 2, 2);
        assert_eq!(registry.release(&old), Release::AlreadyGone);
        assert_eq!(registry.state(&key("k")).unwrap().subscriber_count, 1);
        assert_eq!(registry.release(&new), Release::Destroyed);
    }

    #[test]
    fn resolve_after_close_is_cancelled() {
        let registry = Registry::new();
        let slot = created(&registry, "k");
        assert!(registry.abandon_initial(&slot));

        assert_eq!(
            registry.resolve_initial(&slot, 5, Timestamp::from_millis(1)),
            Err(SyncError::Cancelled)
        );
        assert!(registry.state(&key("k")).is_none());
    }

    #[tokio::test]
    async fn failed_initialization_reaches_waiters() {
        let registry = Registry::new();
        let slot = created(&registry, "k");
        let Acquired::Joined(joined) = registry.acquire(&key("k")).unwrap() else {
            panic!("expected to join");
        };

        assert!(registry.fail_initial(&slot, FetchError::transient("down")));
        assert_eq!(
            joined.wait_ready().await,
            Err(SyncError::Fetch(FetchError::transient("down")))
        );
        assert!(joined.is_closed());
    }

    #[test]
    fn close_all_refuses_new_subscribers() {
        let registry = Registry::new();
        let slot = ready(&registry, "a", 1, 1);
        ready(&registry, "b", 1, 1);

        assert_eq!(registry.close_all(), 2);
        assert!(slot.is_closed());
        assert!(slot.observe().is_none());
        assert!(matches!(
            registry.acquire(&key("c")),
            Err(SyncError::Shutdown)
        ));
    }

    #[test]
    fn connected_flags() {
        let registry = Registry::new();
        let a = ready(&registry, "a", 1, 1);
        let b = ready(&registry, "b", 1, 1);

        registry.set_connected([&key("a")], true);
        assert!(a.is_stream_connected());
        assert!(!b.is_stream_connected());

        registry.set_all_connected(true);
        assert!(b.is_stream_connected());
        registry.set_all_connected(false);
        assert!(!a.is_stream_connected());
    }

    #[test]
    fn independent_keys_do_not_contend() {
        let registry = Arc::new(Registry::new());
        ready(&registry, "a", 0, 0);
        ready(&registry, "b", 0, 0);

        let held = registry.hold_slot_lock(&key("a")).unwrap();
        let guard = held.lock();

        let (done_tx, done_rx) = mpsc::channel();
        let worker = thread::spawn({
            let registry = Arc::clone(&registry);
            move || {
                let outcome = registry.apply_event(ChangeEvent::new("b", 5, 10));
                let _ = done_tx.send(outcome);
            }
        });

        // Key A stays locked while key B is updated.
        let outcome = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        drop(guard);
        worker.join().unwrap();

        assert_eq!(registry.state(&key("b")).unwrap().value, 5);
    }
}
