//! Request handlers for points endpoints.

use crate::auth::{AuthConfig, TokenValidator};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::ledger::PointsLedger;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use pointsync_protocol::{EntityKey, FeedFrame, FeedRequest, SnapshotRequest, SnapshotResponse, Timestamp};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

/// Frames of an open change feed.
pub type FeedStream = BoxStream<'static, FeedFrame>;

/// Context for request handling.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Points ledger (shared across all handlers).
    pub ledger: Arc<PointsLedger>,
    validator: Option<TokenValidator>,
    failing_snapshots: AtomicU32,
    severed: watch::Sender<u64>,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(config: ServerConfig, ledger: Arc<PointsLedger>) -> Self {
        let validator = match (&config.auth_secret, config.require_auth) {
            (Some(secret), true) => Some(TokenValidator::new(
                AuthConfig::new(secret.clone()).with_expiry(config.token_expiry),
            )),
            _ => None,
        };
        Self {
            config,
            ledger,
            validator,
            failing_snapshots: AtomicU32::new(0),
            severed: watch::Sender::new(0),
        }
    }

    /// Returns the token validator, when authentication is enabled.
    pub fn validator(&self) -> Option<&TokenValidator> {
        self.validator.as_ref()
    }

    fn authorize(&self, token: Option<&[u8]>, key: &EntityKey) -> ServerResult<()> {
        if !self.config.require_auth {
            return Ok(());
        }
        let validator = self
            .validator
            .as_ref()
            .ok_or_else(|| ServerError::Internal("auth required but no secret configured".into()))?;
        let token = token.ok_or_else(|| ServerError::NotAuthorized("missing token".into()))?;
        validator.authorize(token, key)
    }

    fn take_snapshot_failure(&self) -> bool {
        self.failing_snapshots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Handler for points requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Handles a snapshot request.
    ///
    /// Failures are reported inside the response so the client can tell
    /// retryable errors from rejections.
    pub fn handle_snapshot(&self, request: SnapshotRequest) -> SnapshotResponse {
        let key = request.entity_key;

        if let Err(e) = self.context.authorize(request.token.as_deref(), &key) {
            debug!(key = %key, error = %e, "snapshot rejected");
            return SnapshotResponse::rejected(key, e.to_string());
        }

        if self.context.take_snapshot_failure() {
            debug!(key = %key, "injected snapshot failure");
            return SnapshotResponse::error(key, "store temporarily unavailable");
        }

        match self.context.ledger.get(&key) {
            Some(snapshot) => SnapshotResponse::found(key, snapshot),
            None => SnapshotResponse::not_found(key),
        }
    }

    /// Opens a change feed for the keys in the request's filter.
    ///
    /// When authentication is enabled, every key must belong to the token's
    /// owner.
    pub fn open_feed(&self, request: FeedRequest) -> ServerResult<FeedStream> {
        if request.filter.is_empty() {
            return Err(ServerError::InvalidRequest("empty feed filter".into()));
        }
        for key in request.filter.iter() {
            self.context.authorize(request.token.as_deref(), key)?;
        }

        let filter = request.filter;
        let events = BroadcastStream::new(self.context.ledger.subscribe()).filter_map(move |item| {
            let frame = match item {
                Ok(event) if filter.contains(&event.entity_key) => Some(FeedFrame::Event(event)),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    warn!(missed, "feed lagged behind ledger");
                    Some(FeedFrame::Closing {
                        reason: format!("feed lagged by {missed} events"),
                    })
                }
            };
            futures::future::ready(frame)
        });

        let frames = match self.context.config.heartbeat_interval {
            Some(interval) => {
                let beats = stream::unfold((), move |()| async move {
                    tokio::time::sleep(interval).await;
                    Some((FeedFrame::Heartbeat(Timestamp::now()), ()))
                });
                stream::select(events, beats).boxed()
            }
            None => events.boxed(),
        };

        // Ends the feed at the next sever; a lag closes it as well.
        let mut severed = self.context.severed.subscribe();
        let cut = async move {
            let _ = severed.changed().await;
        };
        let frames = frames
            .take_until(cut)
            .scan(false, |closed, frame| {
                let item = if *closed {
                    None
                } else {
                    *closed = matches!(frame, FeedFrame::Closing { .. });
                    Some(frame)
                };
                futures::future::ready(item)
            })
            .boxed();

        debug!(feeds = self.context.ledger.subscriber_count(), "feed opened");
        Ok(frames)
    }

    /// Terminates every open feed.
    pub fn sever_feeds(&self) {
        self.context.severed.send_modify(|generation| *generation += 1);
    }

    /// Makes the next `count` snapshot reads fail with a retryable error.
    pub fn fail_next_snapshots(&self, count: u32) {
        self.context.failing_snapshots.store(count, Ordering::Release);
    }
}
