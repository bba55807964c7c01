//! Snapshot fetching.

use crate::error::FetchError;
use async_trait::async_trait;
use parking_lot::Mutex;
use pointsync_protocol::{EntityKey, Snapshot};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// One-shot reader of the committed counter value for a key.
///
/// Implementations must not cache: every call reflects the store's latest
/// committed value at call time. Retrying is the caller's business.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync + 'static {
    /// Reads the current value for `key`.
    ///
    /// Returns [`FetchError::NotFound`] when the store has no record.
    async fn fetch_snapshot(&self, key: &EntityKey) -> Result<Snapshot, FetchError>;
}

#[async_trait]
impl<F: SnapshotFetcher + ?Sized> SnapshotFetcher for Arc<F> {
    async fn fetch_snapshot(&self, key: &EntityKey) -> Result<Snapshot, FetchError> {
        (**self).fetch_snapshot(key).await
    }
}

/// A scripted fetcher for testing.
///
/// Values are served from an in-memory map. Failures can be queued per key,
/// fetches can be delayed or held until [`resume`](MockFetcher::resume), and
/// every call is recorded.
pub struct MockFetcher {
    values: Mutex<HashMap<EntityKey, Snapshot>>,
    failures: Mutex<HashMap<EntityKey, VecDeque<FetchError>>>,
    calls: Mutex<Vec<EntityKey>>,
    call_count: watch::Sender<usize>,
    paused: watch::Sender<bool>,
    delay: Mutex<Option<Duration>>,
}

impl MockFetcher {
    /// Creates a fetcher with no records.
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            call_count: watch::Sender::new(0),
            paused: watch::Sender::new(false),
            delay: Mutex::new(None),
        }
    }

    /// Sets the snapshot returned for `key`.
    pub fn set(&self, key: impl Into<EntityKey>, snapshot: Snapshot) {
        self.values.lock().insert(key.into(), snapshot);
    }

    /// Removes the record for `key`, so fetches return `NotFound`.
    pub fn remove(&self, key: &EntityKey) {
        self.values.lock().remove(key);
    }

    /// Queues a failure returned by the next fetch of `key`.
    pub fn fail_next(&self, key: impl Into<EntityKey>, error: FetchError) {
        self.failures
            .lock()
            .entry(key.into())
            .or_default()
            .push_back(error);
    }

    /// Delays every fetch by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Holds every fetch (after it is recorded) until `resume` is called.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    /// Releases held fetches.
    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Returns every key fetched so far, in call order.
    pub fn calls(&self) -> Vec<EntityKey> {
        self.calls.lock().clone()
    }

    /// Returns how many times `key` was fetched.
    pub fn calls_for(&self, key: &EntityKey) -> usize {
        self.calls.lock().iter().filter(|k| *k == key).count()
    }

    /// Waits until at least `count` fetches have started.
    pub async fn wait_for_calls(&self, count: usize) {
        let mut rx = self.call_count.subscribe();
        // The sender lives in self, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n >= count).await;
    }
}

impl Default for MockFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotFetcher for MockFetcher {
    async fn fetch_snapshot(&self, key: &EntityKey) -> Result<Snapshot, FetchError> {
        self.calls.lock().push(key.clone());
        self.call_count.send_modify(|n| *n += 1);

        let mut paused = self.paused.subscribe();
        let _ = paused.wait_for(|p| !*p).await;

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self
            .failures
            .lock()
            .get_mut(key)
            .and_then(|queue| queue.pop_front())
        {
            return Err(error);
        }

        self.values
            .lock()
            .get(key)
            .copied()
            .ok_or(FetchError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_fetcher_serves_values() {
        let fetcher = MockFetcher::new();
        fetcher.set("user-1", Snapshot::new(5, 10));

        let key = EntityKey::from("user-1");
        assert_eq!(fetcher.fetch_snapshot(&key).await, Ok(Snapshot::new(5, 10)));

        let missing = EntityKey::from("user-2");
        assert_eq!(
            fetcher.fetch_snapshot(&missing).await,
            Err(FetchError::NotFound)
        );
        assert_eq!(fetcher.calls(), vec![key.clone(), missing]);
        assert_eq!(fetcher.calls_for(&key), 1);
    }

    #[tokio::test]
    async fn mock_fetcher_queued_failures() {
        let fetcher = MockFetcher::new();
        fetcher.set("user-1", Snapshot::new(5, 10));
        fetcher.fail_next("user-1", FetchError::transient("reset"));

        let key = EntityKey::from("user-1");
        assert!(fetcher.fetch_snapshot(&key).await.is_err());
        assert!(fetcher.fetch_snapshot(&key).await.is_ok());
    }

    #[tokio::test]
    async fn mock_fetcher_pause_holds_fetch() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.set("user-1", Snapshot::new(1, 1));
        fetcher.pause();

        let task = tokio::spawn({
            let fetcher = Arc::clone(&fetcher);
            async move { fetcher.fetch_snapshot(&EntityKey::from("user-1")).await }
        });

        fetcher.wait_for_calls(1).await;
        assert!(!task.is_finished());

        fetcher.resume();
        assert_eq!(task.await.unwrap(), Ok(Snapshot::new(1, 1)));
    }
}
