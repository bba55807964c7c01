//! Main points server.

use crate::auth::TokenValidator;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{FeedStream, HandlerContext, RequestHandler};
use crate::ledger::PointsLedger;
use futures::stream::BoxStream;
use futures::StreamExt;
use pointsync_protocol::{FeedRequest, MessageKind, SnapshotRequest, SnapshotResponse};
use std::sync::Arc;

/// The points server.
///
/// This server answers snapshot reads and serves change feeds over the
/// PointSync wire protocol, backed by an in-memory ledger.
///
/// # Example
///
/// ```
/// use pointsync_server::{PointsServer, ServerConfig};
///
/// let server = PointsServer::new(ServerConfig::default());
/// server.ledger().award("user-1", 50);
///
/// // In a real application, you would expose endpoints
/// // that call server.handle_post() and server.handle_feed()
/// ```
pub struct PointsServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl PointsServer {
    /// Creates a new points server with an empty ledger.
    pub fn new(config: ServerConfig) -> Self {
        let ledger = Arc::new(PointsLedger::new(config.feed_capacity));
        Self::with_ledger(config, ledger)
    }

    /// Creates a points server over an existing ledger.
    pub fn with_ledger(config: ServerConfig, ledger: Arc<PointsLedger>) -> Self {
        let context = Arc::new(HandlerContext::new(config, ledger));
        let handler = RequestHandler::new(Arc::clone(&context));

        Self { handler, context }
    }

    /// Returns the ledger.
    pub fn ledger(&self) -> &Arc<PointsLedger> {
        &self.context.ledger
    }

    /// Returns the token validator, when authentication is enabled.
    pub fn validator(&self) -> Option<&TokenValidator> {
        self.context.validator()
    }

    /// Handles a snapshot request.
    pub fn handle_snapshot(&self, request: SnapshotRequest) -> SnapshotResponse {
        self.handler.handle_snapshot(request)
    }

    /// Opens a change feed.
    pub fn open_feed(&self, request: FeedRequest) -> ServerResult<FeedStream> {
        self.handler.open_feed(request)
    }

    /// Handles an encoded request (dispatches on the endpoint path).
    pub fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String> {
        match MessageKind::from_endpoint(path) {
            Some(MessageKind::SnapshotRequest) => {
                let request = SnapshotRequest::decode(body).map_err(|e| e.to_string())?;
                self.handle_snapshot(request)
                    .encode()
                    .map_err(|e| e.to_string())
            }
            _ => Err(ServerError::InvalidRequest(format!("no request endpoint at {path}")).to_string()),
        }
    }

    /// Opens an encoded feed (frames are CBOR-encoded `FeedFrame`s).
    pub fn handle_feed(
        &self,
        path: &str,
        body: &[u8],
    ) -> Result<BoxStream<'static, Result<Vec<u8>, String>>, String> {
        if MessageKind::from_endpoint(path) != Some(MessageKind::FeedRequest) {
            return Err(ServerError::InvalidRequest(format!("no feed endpoint at {path}")).to_string());
        }
        let request = FeedRequest::decode(body).map_err(|e| e.to_string())?;
        let feed = self.open_feed(request).map_err(|e| e.to_string())?;
        Ok(feed
            .map(|frame| frame.encode().map_err(|e| e.to_string()))
            .boxed())
    }

    /// Terminates every open feed, as a dropped connection would.
    pub fn sever_feeds(&self) {
        self.handler.sever_feeds();
    }

    /// Makes the next `count` snapshot reads fail with a retryable error.
    pub fn fail_next_snapshots(&self, count: u32) {
        self.handler.fail_next_snapshots(count);
    }

    /// Returns the number of open feeds.
    pub fn open_feed_count(&self) -> usize {
        self.context.ledger.subscriber_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pointsync_protocol::{EntityKey, FeedFrame, KeyFilter};

    #[test]
    fn server_lifecycle() {
        let server = PointsServer::new(ServerConfig::default());
        assert!(server.ledger().is_empty());
        assert_eq!(server.open_feed_count(), 0);
        assert!(server.validator().is_none());
    }

    #[test]
    fn encoded_snapshot_flow() {
        let server = PointsServer::new(ServerConfig::default());
        server.ledger().award("u1", 30);

        let body = SnapshotRequest::new("u1").encode().unwrap();
        let response = server.handle_post("/points/snapshot", &body).unwrap();
        let response = SnapshotResponse::decode(&response).unwrap();
        assert_eq!(response.snapshot.unwrap().value, 30);
    }

    #[test]
    fn unknown_endpoint() {
        let server = PointsServer::new(ServerConfig::default());
        assert!(server.handle_post("/points/feed", &[]).is_err());
        assert!(server.handle_post("/nope", &[]).is_err());
        assert!(server.handle_feed("/points/snapshot", &[]).is_err());
    }

    #[tokio::test]
    async fn encoded_feed_flow() {
        let server = PointsServer::new(ServerConfig::default());
        let filter: KeyFilter = [EntityKey::from("u1")].into_iter().collect();
        let body = FeedRequest::new(filter).encode().unwrap();

        let mut feed = server.handle_feed("/points/feed", &body).unwrap();
        assert_eq!(server.open_feed_count(), 1);

        let event = server.ledger().award("u1", 3);
        let frame = feed.next().await.unwrap().unwrap();
        assert_eq!(FeedFrame::decode(&frame).unwrap(), FeedFrame::Event(event));

        server.sever_feeds();
        assert!(feed.next().await.is_none());
        drop(feed);
        assert_eq!(server.open_feed_count(), 0);
    }

    #[test]
    fn shared_ledger() {
        let ledger = Arc::new(PointsLedger::default());
        let server = PointsServer::with_ledger(ServerConfig::default(), Arc::clone(&ledger));

        ledger.award("u1", 1);
        let response = server.handle_snapshot(SnapshotRequest::new("u1"));
        assert_eq!(response.snapshot.unwrap().value, 1);
    }
}
