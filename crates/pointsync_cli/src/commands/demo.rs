//! Demo command implementation.
//!
//! Runs a synchronizer against an in-process points server over the framed
//! loopback transport, drives random ledger writes with periodic feed
//! outages, and reports whether every subscriber converged.

use async_trait::async_trait;
use pointsync_engine::{
    FrameFeed, FramedTransport, LoopbackClient, LoopbackServer, RetryConfig, SyncConfig,
    SyncStats, Synchronizer,
};
use pointsync_protocol::{CounterValue, EntityKey};
use pointsync_server::{PointsServer, ServerConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Serves a `PointsServer` in-process.
struct LocalServer(Arc<PointsServer>);

#[async_trait]
impl LoopbackServer for LocalServer {
    async fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String> {
        self.0.handle_post(path, body)
    }

    async fn handle_feed(&self, path: &str, body: &[u8]) -> Result<FrameFeed, String> {
        self.0.handle_feed(path, body)
    }
}

/// Options for a demo run.
#[derive(Debug, Clone)]
pub struct DemoOptions {
    /// Accounts to subscribe to.
    pub keys: Vec<String>,
    /// Number of ledger writes.
    pub updates: usize,
    /// Sever feeds after this many writes (0 disables).
    pub sever_every: usize,
    /// Seed for the write sequence.
    pub seed: u64,
    /// How long to wait for convergence.
    pub timeout: Duration,
}

/// Demo result.
#[derive(Debug, Serialize)]
pub struct DemoReport {
    /// Whether every subscriber matched the ledger before the timeout.
    pub converged: bool,
    /// Per-account results.
    pub accounts: Vec<AccountReport>,
    /// Synchronizer statistics.
    pub stats: StatsReport,
    /// Number of feed outages injected.
    pub outages: usize,
}

/// Result for a single account.
#[derive(Debug, Serialize)]
pub struct AccountReport {
    /// Account key.
    pub key: String,
    /// Authoritative balance.
    pub ledger: CounterValue,
    /// Locally synchronized value.
    pub synced: CounterValue,
    /// Pushed updates seen by the watching subscriber.
    pub updates_seen: usize,
}

/// Synchronizer statistics.
#[derive(Debug, Serialize)]
pub struct StatsReport {
    /// Events applied.
    pub events_applied: u64,
    /// Stale events dropped.
    pub stale_dropped: u64,
    /// Events buffered during initialization.
    pub events_buffered: u64,
    /// Stream reconnects.
    pub reconnects: u64,
    /// Keys re-snapshotted after reconnects.
    pub resyncs: u64,
    /// Streams opened.
    pub streams_opened: u64,
}

impl From<SyncStats> for StatsReport {
    fn from(stats: SyncStats) -> Self {
        Self {
            events_applied: stats.events_applied,
            stale_dropped: stats.stale_dropped,
            events_buffered: stats.events_buffered,
            reconnects: stats.reconnects,
            resyncs: stats.resyncs,
            streams_opened: stats.streams_opened,
        }
    }
}

/// Runs the demo command.
pub async fn run(options: DemoOptions, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let report = simulate(&options).await?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_text(&report),
    }

    if !report.converged {
        return Err("subscribers did not converge before the timeout".into());
    }
    Ok(())
}

/// Drives the simulation and collects the report.
pub async fn simulate(options: &DemoOptions) -> Result<DemoReport, Box<dyn std::error::Error>> {
    if options.keys.is_empty() {
        return Err("at least one key is required".into());
    }

    let server = Arc::new(PointsServer::new(
        ServerConfig::default().with_heartbeat(Duration::from_millis(250)),
    ));
    let transport = Arc::new(FramedTransport::new(
        "loopback://demo",
        LoopbackClient::new(LocalServer(Arc::clone(&server))),
    ));
    let config = SyncConfig::default().with_reconnect(
        RetryConfig::new(u32::MAX)
            .with_initial_delay(Duration::from_millis(20))
            .with_max_delay(Duration::from_millis(500)),
    );
    let sync = Synchronizer::new(Arc::clone(&transport), transport, config);

    let mut readers = Vec::with_capacity(options.keys.len());
    let mut watchers = Vec::with_capacity(options.keys.len());
    for key in &options.keys {
        readers.push(sync.subscribe(key.as_str()).await?);

        let mut watcher = sync.subscribe(key.as_str()).await?;
        watchers.push(tokio::spawn(async move {
            let mut seen = 0usize;
            while let Some(observed) = watcher.changed().await {
                seen += 1;
                debug!(key = %watcher.key(), value = observed.value, ts = %observed.timestamp, "update");
            }
            seen
        }));
    }
    info!(keys = options.keys.len(), "subscribed");

    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut outages = 0;
    for i in 0..options.updates {
        let key = options.keys[rng.gen_range(0..options.keys.len())].as_str();
        if rng.gen_bool(0.3) {
            if let Err(e) = server.ledger().deduct(key, rng.gen_range(1..=20)) {
                debug!(error = %e, "deduct skipped");
            }
        } else {
            server.ledger().award(key, rng.gen_range(1..=50));
        }

        if options.sever_every > 0 && (i + 1) % options.sever_every == 0 {
            info!(after = i + 1, "severing feeds");
            server.sever_feeds();
            outages += 1;
        }
        tokio::task::yield_now().await;
    }

    let converged = tokio::time::timeout(options.timeout, async {
        loop {
            let settled = readers.iter().all(|handle| {
                handle.is_stream_connected()
                    && handle.read() == server.ledger().balance(handle.key())
            });
            if settled {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok();
    if !converged {
        warn!("timed out waiting for convergence");
    }

    let stats = sync.stats();
    let balances: Vec<(EntityKey, CounterValue, CounterValue)> = readers
        .iter()
        .map(|h| (h.key().clone(), server.ledger().balance(h.key()), h.read()))
        .collect();

    sync.teardown().await;
    let mut accounts = Vec::with_capacity(balances.len());
    for ((key, ledger, synced), watcher) in balances.into_iter().zip(watchers) {
        accounts.push(AccountReport {
            key: key.to_string(),
            ledger,
            synced,
            updates_seen: watcher.await.unwrap_or_default(),
        });
    }

    Ok(DemoReport {
        converged,
        accounts,
        stats: stats.into(),
        outages,
    })
}

fn print_text(report: &DemoReport) {
    println!("PointSync Demo");
    println!("==============");
    println!();
    println!("{:<16} {:>10} {:>10} {:>8}", "Account", "Ledger", "Synced", "Pushes");
    for account in &report.accounts {
        println!(
            "{:<16} {:>10} {:>10} {:>8}",
            account.key, account.ledger, account.synced, account.updates_seen
        );
    }
    println!();
    println!("Feed outages:     {}", report.outages);
    println!("Reconnects:       {}", report.stats.reconnects);
    println!("Resyncs:          {}", report.stats.resyncs);
    println!("Events applied:   {}", report.stats.events_applied);
    println!("Stale dropped:    {}", report.stats.stale_dropped);
    println!("Streams opened:   {}", report.stats.streams_opened);
    println!();
    if report.converged {
        println!("✓ All subscribers converged");
    } else {
        println!("✗ Subscribers did not converge");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn demo_converges_through_outages() {
        let options = DemoOptions {
            keys: vec!["alice".into(), "bob".into()],
            updates: 40,
            sever_every: 10,
            seed: 1,
            timeout: Duration::from_secs(10),
        };

        let report = simulate(&options).await.unwrap();
        assert!(report.converged);
        assert_eq!(report.outages, 4);
        assert_eq!(report.accounts.len(), 2);
        for account in &report.accounts {
            assert_eq!(account.ledger, account.synced);
        }
        assert!(report.stats.reconnects >= 1);
    }

    #[tokio::test]
    async fn demo_requires_keys() {
        let options = DemoOptions {
            keys: Vec::new(),
            updates: 1,
            sever_every: 0,
            seed: 1,
            timeout: Duration::from_secs(1),
        };
        assert!(simulate(&options).await.is_err());
    }
}
