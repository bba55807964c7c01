//! Framed wire transport.
//!
//! This module speaks the CBOR messages from `pointsync_protocol` over a
//! byte-level client. The actual client is abstracted via a trait to allow
//! different implementations (HTTP + server-sent events, WebSocket,
//! in-process loopback).

use crate::error::{FetchError, StreamError};
use crate::fetcher::SnapshotFetcher;
use crate::transport::{ChangeStream, ChangeStreamTransport};
use async_trait::async_trait;
use futures::future::ready;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::RwLock;
use pointsync_protocol::{
    EntityKey, FeedFrame, FeedRequest, KeyFilter, MessageKind, Snapshot, SnapshotRequest,
    SnapshotResponse,
};
use tracing::{debug, trace};

/// Raw frames of an open feed.
pub type FrameFeed = BoxStream<'static, Result<Vec<u8>, String>>;

/// Byte-level client abstraction.
///
/// Implement this trait to provide the actual network transport.
#[async_trait]
pub trait FrameClient: Send + Sync + 'static {
    /// Sends a request and returns the response body.
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, String>;

    /// Opens a long-lived feed and returns its frames.
    async fn open_feed(&self, url: &str, body: Vec<u8>) -> Result<FrameFeed, String>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// CBOR-framed transport implementing both the fetcher and the stream side.
pub struct FramedTransport<C: FrameClient> {
    /// Base URL of the points service (e.g., "https://points.example.com").
    base_url: String,
    /// Client implementation.
    client: C,
    /// Bearer credential attached to every request.
    token: Option<Vec<u8>>,
    /// Last error message.
    last_error: RwLock<Option<String>>,
}

impl<C: FrameClient> FramedTransport<C> {
    /// Creates a new framed transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into(),
            client,
            token: None,
            last_error: RwLock::new(None),
        }
    }

    /// Attaches a bearer credential to every request.
    pub fn with_token(mut self, token: Vec<u8>) -> Self {
        self.token = Some(token);
        self
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Returns true if the client reports itself healthy.
    pub fn is_healthy(&self) -> bool {
        self.client.is_healthy()
    }

    fn set_error(&self, err: &str) {
        *self.last_error.write() = Some(err.to_string());
    }

    fn clear_error(&self) {
        *self.last_error.write() = None;
    }

    fn url(&self, kind: MessageKind) -> String {
        format!("{}{}", self.base_url, kind.endpoint().unwrap_or_default())
    }
}

#[async_trait]
impl<C: FrameClient> SnapshotFetcher for FramedTransport<C> {
    async fn fetch_snapshot(&self, key: &EntityKey) -> Result<Snapshot, FetchError> {
        let mut request = SnapshotRequest::new(key.clone());
        if let Some(token) = &self.token {
            request = request.with_token(token.clone());
        }
        let body = request
            .encode()
            .map_err(|e| FetchError::rejected(format!("failed to encode request: {e}")))?;

        let response_body = self
            .client
            .post(&self.url(MessageKind::SnapshotRequest), body)
            .await
            .map_err(|e| {
                self.set_error(&e);
                FetchError::transient(e)
            })?;
        self.clear_error();

        let response = SnapshotResponse::decode(&response_body)
            .map_err(|e| FetchError::rejected(format!("failed to decode response: {e}")))?;

        if response.entity_key != *key {
            return Err(FetchError::rejected(format!(
                "response for {} answered request for {}",
                response.entity_key, key
            )));
        }

        match (response.error, response.snapshot) {
            (Some(message), _) if response.retryable => Err(FetchError::transient(message)),
            (Some(message), _) => Err(FetchError::rejected(message)),
            (None, Some(snapshot)) => Ok(snapshot),
            (None, None) => Err(FetchError::NotFound),
        }
    }
}

#[async_trait]
impl<C: FrameClient> ChangeStreamTransport for FramedTransport<C> {
    async fn open_stream(&self, filter: &KeyFilter) -> Result<ChangeStream, StreamError> {
        let mut request = FeedRequest::new(filter.clone());
        if let Some(token) = &self.token {
            request = request.with_token(token.clone());
        }
        let body = request
            .encode()
            .map_err(|e| StreamError::open_failed(format!("failed to encode request: {e}")))?;

        let feed = self
            .client
            .open_feed(&self.url(MessageKind::FeedRequest), body)
            .await
            .map_err(|e| {
                self.set_error(&e);
                StreamError::open_failed(e)
            })?;
        self.clear_error();
        debug!(keys = filter.len(), "feed opened");

        Ok(ChangeStream::new(filter.clone(), decode_feed(feed)))
    }
}

/// Turns raw frames into change events. Heartbeats are swallowed; a closing
/// frame, a bad frame or a client error ends the stream with an error.
fn decode_feed(
    feed: FrameFeed,
) -> impl futures::Stream<Item = Result<pointsync_protocol::ChangeEvent, StreamError>> + Send {
    feed.filter_map(|frame| {
        let item = match frame.map(|bytes| FeedFrame::decode(&bytes)) {
            Ok(Ok(FeedFrame::Event(event))) => Some(Ok(event)),
            Ok(Ok(FeedFrame::Heartbeat(at))) => {
                trace!(server_time = %at, "feed heartbeat");
                None
            }
            Ok(Ok(FeedFrame::Closing { reason })) => Some(Err(StreamError::disconnected(reason))),
            Ok(Err(e)) => Some(Err(StreamError::Protocol(e.to_string()))),
            Err(e) => Some(Err(StreamError::disconnected(e))),
        };
        ready(item)
    })
}

/// A loopback client that routes requests directly to an in-process server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }

    /// Returns the server.
    pub fn server(&self) -> &S {
        &self.server
    }
}

/// Trait for servers that can handle loopback requests.
#[async_trait]
pub trait LoopbackServer: Send + Sync + 'static {
    /// Handles a request and returns the response.
    async fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String>;

    /// Opens a feed and returns its frames.
    async fn handle_feed(&self, path: &str, body: &[u8]) -> Result<FrameFeed, String>;
}

fn endpoint_path(url: &str) -> &str {
    url.rfind("/points/").map(|i| &url[i..]).unwrap_or(url)
}

#[async_trait]
impl<S: LoopbackServer> FrameClient for LoopbackClient<S> {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, String> {
        self.server.handle_post(endpoint_path(url), &body).await
    }

    async fn open_feed(&self, url: &str, body: Vec<u8>) -> Result<FrameFeed, String> {
        self.server.handle_feed(endpoint_path(url), &body).await
    }
}
