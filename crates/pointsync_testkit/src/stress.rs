//! Stress tests for PointSync.
//!
//! These tests verify behavior under heavy subscription churn and
//! concurrent writes with repeated feed outages.

use crate::fixtures::{eventually, ServerHarness, TestSync};
use pointsync_engine::ChangeEvent;
use pointsync_protocol::{EntityKey, Timestamp};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
    /// Whether the synchronizer ended in a consistent state.
    pub consistent: bool,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration, consistent: bool) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
            consistent,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
        println!("Consistent: {}", self.consistent);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Operations per task.
    pub operations: usize,
    /// Number of concurrent tasks.
    pub tasks: usize,
    /// Number of distinct keys.
    pub keys: usize,
    /// Sever feeds after this many writes (0 disables).
    pub sever_every: usize,
    /// Seed for random choices.
    pub seed: u64,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 200,
            tasks: 8,
            keys: 16,
            sever_every: 50,
            seed: 42,
        }
    }
}

fn key_name(index: usize) -> EntityKey {
    EntityKey::from(format!("account-{index}"))
}

/// Many tasks subscribe and unsubscribe random keys while events flow.
///
/// Consistent when, after every handle is gone, no key state is left and
/// the stream filter is empty.
pub async fn stress_subscription_churn(config: &StressConfig) -> StressTestResult {
    let harness = Arc::new(TestSync::new());
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let clock = Arc::new(AtomicU64::new(1));

    let start = Instant::now();
    let tasks: Vec<_> = (0..config.tasks)
        .map(|t| {
            let harness = Arc::clone(&harness);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let clock = Arc::clone(&clock);
            let config = config.clone();

            tokio::spawn(async move {
                let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(t as u64));
                let mut held = Vec::new();
                for i in 0..config.operations {
                    let key = key_name(rng.gen_range(0..config.keys));
                    match rng.gen_range(0..3) {
                        0 => match harness.subscribe(key).await {
                            Ok(handle) => {
                                held.push(handle);
                                successful.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(_) => {
                                failed.fetch_add(1, Ordering::Relaxed);
                            }
                        },
                        1 if !held.is_empty() => {
                            let index = rng.gen_range(0..held.len());
                            drop(held.swap_remove(index));
                            successful.fetch_add(1, Ordering::Relaxed);
                        }
                        _ => {
                            let ts = Timestamp::from_millis(clock.fetch_add(1, Ordering::Relaxed));
                            harness.transport.push(ChangeEvent::new(key, i as u64, ts));
                            successful.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    if config.sever_every > 0 && i % config.sever_every == config.sever_every - 1 {
                        harness.transport.sever_all();
                    }
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    for task in tasks {
        if task.await.is_err() {
            failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    let consistent = harness.active_keys() == 0
        && eventually(Duration::from_secs(5), || {
            harness.watched_keys().is_empty() && harness.transport.live_filters().is_empty()
        })
        .await;

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
        consistent,
    )
}

/// Concurrent ledger writers against a synchronizer over the wire protocol,
/// with periodic feed outages.
///
/// Consistent when every subscribed key converges to its ledger balance.
pub async fn stress_server_convergence(config: &StressConfig) -> StressTestResult {
    let harness = ServerHarness::new();
    let keys: Vec<EntityKey> = (0..config.keys).map(key_name).collect();

    let mut handles = Vec::with_capacity(keys.len());
    for key in &keys {
        match harness.subscribe(key.clone()).await {
            Ok(handle) => handles.push(handle),
            Err(_) => {
                return StressTestResult::new(0, 1, Duration::ZERO, false);
            }
        }
    }

    let writes = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let tasks: Vec<_> = (0..config.tasks)
        .map(|t| {
            let server = Arc::clone(&harness.server);
            let writes = Arc::clone(&writes);
            let keys = keys.clone();
            let config = config.clone();

            tokio::spawn(async move {
                let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(t as u64));
                for _ in 0..config.operations {
                    let key = keys[rng.gen_range(0..keys.len())].clone();
                    server.ledger().award(key, rng.gen_range(1..=10));

                    let n = writes.fetch_add(1, Ordering::Relaxed) + 1;
                    if config.sever_every > 0 && n % config.sever_every == 0 {
                        server.sever_feeds();
                    }
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    let mut failed = 0;
    for task in tasks {
        if task.await.is_err() {
            failed += 1;
        }
    }

    let consistent = eventually(Duration::from_secs(10), || {
        handles.iter().all(|handle| {
            handle.is_stream_connected()
                && handle.read() == harness.server.ledger().balance(handle.key())
        })
    })
    .await;
    let duration = start.elapsed();

    drop(handles);
    harness.teardown().await;
    StressTestResult::new(writes.load(Ordering::Relaxed), failed, duration, consistent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn churn_leaves_nothing_behind() {
        let config = StressConfig {
            operations: 100,
            tasks: 6,
            keys: 5,
            sever_every: 30,
            seed: 7,
        };

        let result = stress_subscription_churn(&config).await;
        result.print_summary("subscription churn");
        assert!(result.consistent);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.total_ops, config.operations * config.tasks);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_converge() {
        let config = StressConfig {
            operations: 100,
            tasks: 4,
            keys: 8,
            sever_every: 40,
            seed: 3,
        };

        let result = stress_server_convergence(&config).await;
        result.print_summary("server convergence");
        assert!(result.consistent);
        assert_eq!(result.successful_ops, config.operations * config.tasks);
    }
}
