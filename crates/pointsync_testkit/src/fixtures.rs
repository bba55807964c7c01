//! Test fixtures and synchronizer harnesses.
//!
//! Provides ready-wired synchronizers over the mock backends and over an
//! in-process points server.

use async_trait::async_trait;
use pointsync_engine::{
    FrameFeed, FramedTransport, LoopbackClient, LoopbackServer, MockFetcher, MockStreamTransport,
    RetryConfig, SyncConfig, Synchronizer,
};
use pointsync_server::{PointsServer, ServerConfig};
use std::sync::Arc;
use std::time::Duration;

/// A sync config with short backoffs, suitable for tests.
pub fn fast_config() -> SyncConfig {
    SyncConfig::default()
        .with_reconnect(
            RetryConfig::new(u32::MAX)
                .with_initial_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(50))
                .with_jitter(false),
        )
        .with_resync_retry(
            RetryConfig::new(5)
                .with_initial_delay(Duration::from_millis(5))
                .with_jitter(false),
        )
}

/// Polls `condition` until it holds, giving up after `limit`.
///
/// Returns whether the condition was reached.
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

/// Synchronizer over the mock backends.
pub type MockSynchronizer = Synchronizer<Arc<MockFetcher>, Arc<MockStreamTransport>>;

/// A synchronizer wired to scriptable mocks.
pub struct TestSync {
    /// The synchronizer under test.
    pub sync: MockSynchronizer,
    /// Snapshot source.
    pub fetcher: Arc<MockFetcher>,
    /// Change stream source.
    pub transport: Arc<MockStreamTransport>,
}

impl TestSync {
    /// Creates a harness with [`fast_config`].
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    /// Creates a harness with `config`.
    pub fn with_config(config: SyncConfig) -> Self {
        let fetcher = Arc::new(MockFetcher::new());
        let transport = Arc::new(MockStreamTransport::new());
        let sync = Synchronizer::new(Arc::clone(&fetcher), Arc::clone(&transport), config);
        Self {
            sync,
            fetcher,
            transport,
        }
    }
}

impl Default for TestSync {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestSync {
    type Target = MockSynchronizer;

    fn deref(&self) -> &Self::Target {
        &self.sync
    }
}

/// Serves a [`PointsServer`] to the framed transport without a network.
pub struct ServerLoopback(pub Arc<PointsServer>);

#[async_trait]
impl LoopbackServer for ServerLoopback {
    async fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String> {
        self.0.handle_post(path, body)
    }

    async fn handle_feed(&self, path: &str, body: &[u8]) -> Result<FrameFeed, String> {
        self.0.handle_feed(path, body)
    }
}

/// Framed transport connected to an in-process server.
pub type LoopbackTransport = Arc<FramedTransport<LoopbackClient<ServerLoopback>>>;

/// Synchronizer over an in-process server.
pub type ServerSynchronizer = Synchronizer<LoopbackTransport, LoopbackTransport>;

/// A synchronizer talking to a real points server over the wire protocol.
pub struct ServerHarness {
    /// The synchronizer under test.
    pub sync: ServerSynchronizer,
    /// The server behind it.
    pub server: Arc<PointsServer>,
}

impl ServerHarness {
    /// Creates a harness over a default server.
    pub fn new() -> Self {
        Self::with_server(ServerConfig::default(), None)
    }

    /// Creates a harness over a server with `config`, sending `token` if given.
    pub fn with_server(config: ServerConfig, token: Option<Vec<u8>>) -> Self {
        let server = Arc::new(PointsServer::new(config));
        let sync = Self::connect(&server, token);
        Self { sync, server }
    }

    /// Creates another synchronizer connected to `server`.
    pub fn connect(server: &Arc<PointsServer>, token: Option<Vec<u8>>) -> ServerSynchronizer {
        let mut transport = FramedTransport::new(
            "loopback://testkit",
            LoopbackClient::new(ServerLoopback(Arc::clone(server))),
        );
        if let Some(token) = token {
            transport = transport.with_token(token);
        }
        let transport = Arc::new(transport);
        Synchronizer::new(Arc::clone(&transport), transport, fast_config())
    }
}

impl Default for ServerHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for ServerHarness {
    type Target = ServerSynchronizer;

    fn deref(&self) -> &Self::Target {
        &self.sync
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pointsync_engine::{ChangeEvent, Snapshot};

    #[tokio::test]
    async fn mock_harness_subscribes() {
        let harness = TestSync::new();
        harness.fetcher.set("k", Snapshot::new(4, 4));

        let handle = harness.subscribe("k").await.unwrap();
        assert_eq!(handle.read(), 4);

        harness.transport.push(ChangeEvent::new("k", 5, 5));
        assert!(eventually(Duration::from_secs(5), || handle.read() == 5).await);
    }

    #[tokio::test]
    async fn server_harness_subscribes() {
        let harness = ServerHarness::new();
        harness.server.ledger().award("k", 12);

        let handle = harness.subscribe("k").await.unwrap();
        assert_eq!(handle.read(), 12);
    }

    #[tokio::test]
    async fn two_clients_share_one_server() {
        let harness = ServerHarness::new();
        let other = ServerHarness::connect(&harness.server, None);

        let first = harness.subscribe("k").await.unwrap();
        let second = other.subscribe("k").await.unwrap();
        assert_eq!(harness.server.open_feed_count(), 2);

        harness.server.ledger().award("k", 3);
        assert!(
            eventually(Duration::from_secs(5), || first.read() == 3 && second.read() == 3).await
        );
    }

    #[tokio::test]
    async fn eventually_gives_up() {
        assert!(!eventually(Duration::from_millis(20), || false).await);
    }
}
