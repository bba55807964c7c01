//! Change stream transport abstraction.

use crate::error::StreamError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use pointsync_protocol::{ChangeEvent, KeyFilter};
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

/// Identifier of one opened change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(Uuid);

impl StreamId {
    /// Generates a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// An open change stream.
///
/// Yields events for keys in its filter, in whatever order the transport
/// delivers them. An `Err` item or the end of the stream means the
/// connection is gone.
pub struct ChangeStream {
    id: StreamId,
    filter: KeyFilter,
    // Only reached through `&mut self`; the mutex makes the stream `Sync`.
    events: Mutex<BoxStream<'static, Result<ChangeEvent, StreamError>>>,
}

impl ChangeStream {
    /// Wraps a raw event stream opened for `filter`.
    pub fn new(
        filter: KeyFilter,
        events: impl Stream<Item = Result<ChangeEvent, StreamError>> + Send + 'static,
    ) -> Self {
        Self {
            id: StreamId::new(),
            filter,
            events: Mutex::new(events.boxed()),
        }
    }

    /// Returns the stream's identifier.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Returns the filter the stream was opened with.
    pub fn key_filter(&self) -> &KeyFilter {
        &self.filter
    }
}

impl Stream for ChangeStream {
    type Item = Result<ChangeEvent, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.get_mut().as_mut().poll_next(cx)
    }
}

impl fmt::Debug for ChangeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeStream")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

/// A transport that opens filtered change streams against the store.
///
/// This trait abstracts the push channel, allowing for different
/// implementations (WebSocket, server-sent events, in-process, mock).
#[async_trait]
pub trait ChangeStreamTransport: Send + Sync + 'static {
    /// Opens a stream delivering events for the keys in `filter`.
    ///
    /// A successful return does not mean events are flowing yet; no
    /// acknowledgment is implied.
    async fn open_stream(&self, filter: &KeyFilter) -> Result<ChangeStream, StreamError>;

    /// Closes a stream previously returned by `open_stream`.
    async fn close(&self, stream: ChangeStream) {
        drop(stream);
    }
}

#[async_trait]
impl<T: ChangeStreamTransport + ?Sized> ChangeStreamTransport for Arc<T> {
    async fn open_stream(&self, filter: &KeyFilter) -> Result<ChangeStream, StreamError> {
        (**self).open_stream(filter).await
    }

    async fn close(&self, stream: ChangeStream) {
        (**self).close(stream).await
    }
}

type EventSender = mpsc::UnboundedSender<Result<ChangeEvent, StreamError>>;

#[derive(Default)]
struct MockStreams {
    opened: Vec<KeyFilter>,
    live: HashMap<StreamId, (KeyFilter, EventSender)>,
    closed: Vec<StreamId>,
    failing_opens: u32,
    stalled_opens: u32,
    preload: Vec<ChangeEvent>,
}

/// A mock transport for testing.
///
/// Records every filter it is asked to open, lets tests push events into
/// the open streams, and can sever streams or refuse to open them.
pub struct MockStreamTransport {
    streams: Mutex<MockStreams>,
    open_count: watch::Sender<usize>,
}

impl MockStreamTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(MockStreams::default()),
            open_count: watch::Sender::new(0),
        }
    }

    /// Makes the next `count` open attempts fail.
    pub fn fail_next_opens(&self, count: u32) {
        self.streams.lock().failing_opens = count;
    }

    /// Makes the next `count` open attempts hang until the caller gives up.
    pub fn stall_next_opens(&self, count: u32) {
        self.streams.lock().stalled_opens = count;
    }

    /// Queues events delivered at the head of the next opened stream.
    ///
    /// Only events whose key is in that stream's filter are delivered.
    pub fn preload_next_open(&self, events: Vec<ChangeEvent>) {
        self.streams.lock().preload = events;
    }

    /// Delivers an event to every live stream whose filter contains its key.
    ///
    /// Returns the number of streams it was delivered to.
    pub fn push(&self, event: ChangeEvent) -> usize {
        let streams = self.streams.lock();
        streams
            .live
            .values()
            .filter(|(filter, _)| filter.contains(&event.entity_key))
            .filter(|(_, tx)| tx.send(Ok(event.clone())).is_ok())
            .count()
    }

    /// Terminates every live stream with a disconnect error.
    pub fn sever_all(&self) {
        let mut streams = self.streams.lock();
        for (_, (_, tx)) in streams.live.drain() {
            let _ = tx.send(Err(StreamError::disconnected("severed by test")));
        }
    }

    /// Returns every filter passed to a successful or failed open, in order.
    pub fn opened_filters(&self) -> Vec<KeyFilter> {
        self.streams.lock().opened.clone()
    }

    /// Returns the filters of streams that are currently open.
    pub fn live_filters(&self) -> Vec<KeyFilter> {
        self.streams
            .lock()
            .live
            .values()
            .map(|(filter, _)| filter.clone())
            .collect()
    }

    /// Returns the number of streams closed through the transport.
    pub fn closed_count(&self) -> usize {
        self.streams.lock().closed.len()
    }

    /// Waits until at least `count` open attempts have been made.
    pub async fn wait_for_opens(&self, count: usize) {
        let mut rx = self.open_count.subscribe();
        let _ = rx.wait_for(|n| *n >= count).await;
    }
}

impl Default for MockStreamTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeStreamTransport for MockStreamTransport {
    async fn open_stream(&self, filter: &KeyFilter) -> Result<ChangeStream, StreamError> {
        let stalled = {
            let mut streams = self.streams.lock();
            let stalled = streams.stalled_opens > 0;
            if stalled {
                streams.stalled_opens -= 1;
                streams.opened.push(filter.clone());
            }
            stalled
        };
        if stalled {
            self.open_count.send_modify(|n| *n += 1);
            return futures::future::pending().await;
        }

        let result = {
            let mut streams = self.streams.lock();
            streams.opened.push(filter.clone());

            if streams.failing_opens > 0 {
                streams.failing_opens -= 1;
                Err(StreamError::open_failed("mock open failure"))
            } else {
                let (tx, rx) = mpsc::unbounded_channel();
                for event in std::mem::take(&mut streams.preload) {
                    if filter.contains(&event.entity_key) {
                        let _ = tx.send(Ok(event));
                    }
                }
                let stream = ChangeStream::new(filter.clone(), UnboundedReceiverStream::new(rx));
                streams.live.insert(stream.id(), (filter.clone(), tx));
                Ok(stream)
            }
        };
        self.open_count.send_modify(|n| *n += 1);
        result
    }

    async fn close(&self, stream: ChangeStream) {
        let mut streams = self.streams.lock();
        streams.live.remove(&stream.id());
        streams.closed.push(stream.id());
    }
}
