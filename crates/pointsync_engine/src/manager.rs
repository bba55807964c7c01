//! Subscription manager: sole owner of the change stream connection.
//!
//! The manager runs as one tokio task fed by a command channel. It keeps the
//! watched-key set, reopens the stream whenever that set changes, and
//! recovers from disconnects:
//!
//! ```text
//! Idle --watch--> Live --stream ends--> Down --retry due--> Connecting --opened--> Resyncing
//!                  ^                     ^                      |                     |
//!                  |                     +-----open failed------+                     |
//!                  +-----------------------------done-------------------------------+
//! ```
//!
//! Reconnect opens run on their own task, so watch and unwatch commands are
//! served while one is pending. While resyncing, every watched key is
//! re-fetched before any event from the new stream is pumped, so nothing
//! missed during the outage survives.

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::{FetchError, StreamError, SyncError, SyncResult};
use crate::fetcher::SnapshotFetcher;
use crate::registry::Registry;
use crate::transport::{ChangeStream, ChangeStreamTransport};
use futures::future::{join_all, pending};
use futures::{FutureExt, StreamExt};
use parking_lot::RwLock;
use pointsync_protocol::{ChangeEvent, EntityKey, KeyFilter, Snapshot, Timestamp};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, trace, warn};

/// How a watch request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchAck {
    /// The open stream already delivers events for the key.
    Live,
    /// The key will be covered, and resynced, once the stream is back.
    Deferred,
}

pub(crate) enum Command {
    Watch {
        key: EntityKey,
        ack: oneshot::Sender<WatchAck>,
    },
    Unwatch {
        key: EntityKey,
    },
    Shutdown {
        done: Option<oneshot::Sender<()>>,
    },
}

/// Cheap handle used by the synchronizer and subscription handles.
#[derive(Clone)]
pub(crate) struct ManagerHandle {
    commands: mpsc::UnboundedSender<Command>,
    watched: Arc<RwLock<KeyFilter>>,
    connected: Arc<AtomicBool>,
}

impl ManagerHandle {
    /// Queues a watch request. The receiver resolves once the key is covered.
    pub(crate) fn request_watch(&self, key: EntityKey) -> SyncResult<oneshot::Receiver<WatchAck>> {
        let (ack, rx) = oneshot::channel();
        self.commands
            .send(Command::Watch { key, ack })
            .map_err(|_| SyncError::Shutdown)?;
        Ok(rx)
    }

    /// Queues an unwatch request. Never blocks.
    pub(crate) fn unwatch(&self, key: EntityKey) {
        if self.commands.send(Command::Unwatch { key }).is_err() {
            trace!("unwatch after manager shutdown");
        }
    }

    /// Stops the manager and waits for it to close the stream.
    pub(crate) async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Shutdown { done: Some(done) })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Asks the manager to stop without waiting.
    pub(crate) fn shutdown_now(&self) {
        let _ = self.commands.send(Command::Shutdown { done: None });
    }

    pub(crate) fn watched_keys(&self) -> KeyFilter {
        self.watched.read().clone()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

enum Link {
    Idle,
    Live(ChangeStream),
    Down {
        attempt: u32,
        retry_at: Instant,
    },
    Connecting {
        attempt: u32,
        task: JoinHandle<Result<ChangeStream, StreamError>>,
    },
    Resyncing {
        stream: ChangeStream,
        task: JoinHandle<()>,
        late: KeyFilter,
    },
}

impl Link {
    fn name(&self) -> &'static str {
        match self {
            Link::Idle => "idle",
            Link::Live(_) => "live",
            Link::Down { .. } => "down",
            Link::Connecting { .. } => "connecting",
            Link::Resyncing { .. } => "resyncing",
        }
    }
}

enum LinkEvent {
    Stream(Option<Result<ChangeEvent, StreamError>>),
    RetryDue,
    Opened {
        attempt: u32,
        result: Result<ChangeStream, StreamError>,
    },
    ResyncDone,
}

async fn next_link_event(link: &mut Link) -> LinkEvent {
    match link {
        Link::Idle => pending().await,
        Link::Live(stream) => LinkEvent::Stream(stream.next().await),
        Link::Down { retry_at, .. } => {
            sleep_until(*retry_at).await;
            LinkEvent::RetryDue
        }
        Link::Connecting { attempt, task } => {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => Err(StreamError::open_failed(format!("open task failed: {e}"))),
            };
            LinkEvent::Opened {
                attempt: *attempt,
                result,
            }
        }
        Link::Resyncing { task, .. } => {
            if let Err(e) = task.await {
                warn!(error = %e, "resync task failed");
            }
            LinkEvent::ResyncDone
        }
    }
}

pub(crate) struct SubscriptionManager<F, T> {
    fetcher: Arc<F>,
    transport: Arc<T>,
    registry: Arc<Registry>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    counts: HashMap<EntityKey, usize>,
    filter: KeyFilter,
    watched: Arc<RwLock<KeyFilter>>,
    connected: Arc<AtomicBool>,
    link: Link,
}

impl<F, T> SubscriptionManager<F, T>
where
    F: SnapshotFetcher,
    T: ChangeStreamTransport,
{
    /// Spawns the manager task on the current runtime.
    pub(crate) fn spawn(
        fetcher: Arc<F>,
        transport: Arc<T>,
        registry: Arc<Registry>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> ManagerHandle {
        let (commands, rx) = mpsc::unbounded_channel();
        let watched = Arc::new(RwLock::new(KeyFilter::new()));
        let connected = Arc::new(AtomicBool::new(false));

        let manager = Self {
            fetcher,
            transport,
            registry,
            clock,
            config,
            counts: HashMap::new(),
            filter: KeyFilter::new(),
            watched: Arc::clone(&watched),
            connected: Arc::clone(&connected),
            link: Link::Idle,
        };
        tokio::spawn(manager.run(rx));

        ManagerHandle {
            commands,
            watched,
            connected,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        debug!("subscription manager started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Watch { key, ack }) => self.on_watch(key, ack).await,
                    Some(Command::Unwatch { key }) => self.on_unwatch(key).await,
                    Some(Command::Shutdown { done }) => {
                        self.shutdown().await;
                        if let Some(done) = done {
                            let _ = done.send(());
                        }
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                event = next_link_event(&mut self.link) => match event {
                    LinkEvent::Stream(Some(Ok(event))) => {
                        self.registry.apply_event(event);
                    }
                    LinkEvent::Stream(Some(Err(e))) => self.on_stream_lost(e.to_string()).await,
                    LinkEvent::Stream(None) => self.on_stream_lost("stream ended".to_string()).await,
                    LinkEvent::RetryDue => self.on_retry_due(),
                    LinkEvent::Opened { attempt, result } => self.on_reconnect_opened(attempt, result),
                    LinkEvent::ResyncDone => self.on_resync_done().await,
                },
            }
        }
        debug!("subscription manager stopped");
    }

    fn publish_filter(&self) {
        *self.watched.write() = self.filter.clone();
    }

    fn set_link(&mut self, link: Link) {
        self.connected
            .store(matches!(link, Link::Live(_)), Ordering::Release);
        trace!(from = self.link.name(), to = link.name(), "link transition");
        self.link = link;
    }

    async fn on_watch(&mut self, key: EntityKey, ack: oneshot::Sender<WatchAck>) {
        let count = self.counts.entry(key.clone()).or_insert(0);
        *count += 1;

        let reply = if *count == 1 {
            self.filter.insert(key.clone());
            self.publish_filter();
            debug!(key = %key, watched = self.filter.len(), "watching key");
            self.add_key(&key).await
        } else {
            match &self.link {
                Link::Live(stream) if stream.key_filter().contains(&key) => WatchAck::Live,
                _ => WatchAck::Deferred,
            }
        };

        if reply == WatchAck::Live {
            self.registry.set_connected([&key], true);
        }
        if ack.send(reply).is_err() {
            trace!(key = %key, "watch requester went away");
        }
    }

    async fn add_key(&mut self, key: &EntityKey) -> WatchAck {
        match std::mem::replace(&mut self.link, Link::Idle) {
            Link::Idle => self.reopen(None).await,
            Link::Live(stream) => self.reopen(Some(stream)).await,
            Link::Resyncing {
                stream,
                task,
                mut late,
            } => {
                late.insert(key.clone());
                self.link = Link::Resyncing { stream, task, late };
                WatchAck::Deferred
            }
            pending @ (Link::Down { .. } | Link::Connecting { .. }) => {
                self.link = pending;
                WatchAck::Deferred
            }
        }
    }

    async fn on_unwatch(&mut self, key: EntityKey) {
        let Some(count) = self.counts.get_mut(&key) else {
            debug!(key = %key, "unwatch for key that is not watched");
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }

        self.counts.remove(&key);
        self.filter.remove(&key);
        self.publish_filter();
        debug!(key = %key, watched = self.filter.len(), "unwatched key");

        if self.filter.is_empty() {
            self.go_idle().await;
            return;
        }

        match std::mem::replace(&mut self.link, Link::Idle) {
            Link::Live(stream) => {
                self.reopen(Some(stream)).await;
            }
            Link::Resyncing {
                stream,
                task,
                mut late,
            } => {
                // The narrower filter is applied once the resync finishes.
                late.remove(&key);
                self.link = Link::Resyncing { stream, task, late };
            }
            other => self.link = other,
        }
    }

    /// Opens a stream for the current filter and retires `previous` after it.
    ///
    /// On failure the link goes down and reconnects with backoff.
    async fn reopen(&mut self, previous: Option<ChangeStream>) -> WatchAck {
        let opened = self.open().await;
        if let Some(previous) = previous {
            self.retire(previous).await;
        }

        match opened {
            Ok(stream) => {
                self.registry.set_connected(stream.key_filter().iter(), true);
                self.set_link(Link::Live(stream));
                WatchAck::Live
            }
            Err(e) => {
                warn!(error = %e, "failed to open change stream");
                self.registry.set_all_connected(false);
                self.schedule_retry(1);
                WatchAck::Deferred
            }
        }
    }

    async fn open(&self) -> Result<ChangeStream, StreamError> {
        let opened = open_with_timeout(&*self.transport, &self.filter, self.config.open_timeout).await?;

        self.registry.counters().stream_opened();
        debug!(stream = %opened.id(), keys = opened.key_filter().len(), "opened change stream");
        Ok(opened)
    }

    /// Opens a stream for the current filter on a separate task.
    fn spawn_open(&self) -> JoinHandle<Result<ChangeStream, StreamError>> {
        let transport = Arc::clone(&self.transport);
        let filter = self.filter.clone();
        let open_timeout = self.config.open_timeout;
        tokio::spawn(async move { open_with_timeout(&*transport, &filter, open_timeout).await })
    }

    /// Applies whatever the stream already delivered, then closes it.
    async fn retire(&self, mut stream: ChangeStream) {
        while let Some(Some(Ok(event))) = stream.next().now_or_never() {
            self.registry.apply_event(event);
        }
        debug!(stream = %stream.id(), "closing change stream");
        self.transport.close(stream).await;
    }

    fn schedule_retry(&mut self, attempt: u32) {
        let delay = self.config.reconnect.delay_for_attempt(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        self.set_link(Link::Down {
            attempt,
            retry_at: Instant::now() + delay,
        });
    }

    async fn on_stream_lost(&mut self, reason: String) {
        warn!(reason = %reason, "change stream lost");
        if let Link::Live(stream) = std::mem::replace(&mut self.link, Link::Idle) {
            self.transport.close(stream).await;
        }
        self.registry.set_all_connected(false);
        self.schedule_retry(0);
    }

    fn on_retry_due(&mut self) {
        let attempt = match &self.link {
            Link::Down { attempt, .. } => *attempt,
            _ => return,
        };
        if self.filter.is_empty() {
            self.set_link(Link::Idle);
            return;
        }

        debug!(attempt, keys = self.filter.len(), "reconnecting change stream");
        let task = self.spawn_open();
        self.set_link(Link::Connecting { attempt, task });
    }

    fn on_reconnect_opened(&mut self, attempt: u32, result: Result<ChangeStream, StreamError>) {
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                debug!(attempt, error = %e, "reconnect attempt failed");
                self.schedule_retry(attempt.saturating_add(1));
                return;
            }
        };

        self.registry.counters().stream_opened();
        self.registry.counters().reconnected();
        info!(
            attempt,
            stream = %stream.id(),
            keys = stream.key_filter().len(),
            "change stream reconnected"
        );

        // Keys watched while the open was pending get a follow-up refilter.
        let late: KeyFilter = self
            .filter
            .iter()
            .filter(|key| !stream.key_filter().contains(key))
            .cloned()
            .collect();
        let keys: Vec<EntityKey> = stream
            .key_filter()
            .iter()
            .filter(|key| self.filter.contains(key))
            .cloned()
            .collect();
        let task = self.spawn_resync(keys);
        self.set_link(Link::Resyncing { stream, task, late });
    }

    async fn on_resync_done(&mut self) {
        let Link::Resyncing { stream, late, .. } = std::mem::replace(&mut self.link, Link::Idle)
        else {
            return;
        };

        let covered: Vec<&EntityKey> = stream
            .key_filter()
            .iter()
            .filter(|key| !late.contains(key))
            .collect();
        self.registry.set_connected(covered, true);
        debug!(keys = stream.key_filter().len(), "resync complete");

        if *stream.key_filter() == self.filter && late.is_empty() {
            self.set_link(Link::Live(stream));
            return;
        }

        // Keys were added or removed while resyncing.
        if self.reopen(Some(stream)).await == WatchAck::Deferred {
            return;
        }
        let late: Vec<EntityKey> = late
            .iter()
            .filter(|key| self.filter.contains(key))
            .cloned()
            .collect();
        if late.is_empty() {
            return;
        }
        self.registry.set_connected(late.iter(), false);

        if let Link::Live(stream) = std::mem::replace(&mut self.link, Link::Idle) {
            let task = self.spawn_resync(late);
            self.set_link(Link::Resyncing {
                stream,
                task,
                late: KeyFilter::new(),
            });
        }
    }

    async fn go_idle(&mut self) {
        match std::mem::replace(&mut self.link, Link::Idle) {
            Link::Live(stream) => self.transport.close(stream).await,
            Link::Resyncing { stream, task, .. } => {
                task.abort();
                self.transport.close(stream).await;
            }
            Link::Connecting { task, .. } => {
                task.abort();
                // The open may have finished before the abort landed.
                if let Ok(Ok(stream)) = task.await {
                    self.transport.close(stream).await;
                }
            }
            Link::Idle | Link::Down { .. } => {}
        }
        self.set_link(Link::Idle);
        debug!("no keys watched; stream closed");
    }

    async fn shutdown(&mut self) {
        self.go_idle().await;
        self.counts.clear();
        self.filter = KeyFilter::new();
        self.publish_filter();
    }

    fn spawn_resync(&self, keys: Vec<EntityKey>) -> JoinHandle<()> {
        let fetcher = Arc::clone(&self.fetcher);
        let registry = Arc::clone(&self.registry);
        let clock = Arc::clone(&self.clock);
        let config = self.config.clone();

        tokio::spawn(async move {
            join_all(
                keys.iter()
                    .map(|key| resync_key(&*fetcher, &registry, &*clock, &config, key)),
            )
            .await;
        })
    }
}

async fn open_with_timeout<T: ChangeStreamTransport>(
    transport: &T,
    filter: &KeyFilter,
    open_timeout: Duration,
) -> Result<ChangeStream, StreamError> {
    timeout(open_timeout, transport.open_stream(filter))
        .await
        .unwrap_or_else(|_| Err(StreamError::open_failed("open timed out")))
}

/// Re-fetches one key after a reconnect, retrying per `resync_retry`.
async fn resync_key<F: SnapshotFetcher>(
    fetcher: &F,
    registry: &Registry,
    clock: &dyn Clock,
    config: &SyncConfig,
    key: &EntityKey,
) {
    let mut attempts = 0u32;
    loop {
        let fetched_at = clock.now();
        let result = timeout(config.fetch_timeout, fetcher.fetch_snapshot(key))
            .await
            .unwrap_or(Err(FetchError::Timeout));

        let error = match result {
            Ok(snapshot) => {
                apply_resync(registry, key, snapshot, fetched_at);
                return;
            }
            Err(FetchError::NotFound) => {
                apply_resync(registry, key, Snapshot::new(0, Timestamp::ZERO), fetched_at);
                return;
            }
            Err(e) => e,
        };

        attempts += 1;
        if !error.is_retryable() || !config.resync_retry.allows_attempt(attempts) {
            warn!(key = %key, attempts, error = %error, "giving up on resync snapshot");
            return;
        }
        let delay = config.resync_retry.delay_for_attempt(attempts);
        debug!(key = %key, attempts, delay_ms = delay.as_millis() as u64, "retrying resync snapshot");
        sleep(delay).await;
    }
}

fn apply_resync(registry: &Registry, key: &EntityKey, snapshot: Snapshot, fetched_at: Timestamp) {
    let basis = snapshot.basis(fetched_at);
    let outcome = registry.apply_resync(key, snapshot.value, basis);
    trace!(key = %key, value = snapshot.value, ts = %basis, ?outcome, "resync snapshot");
}
