//! Configuration for the synchronizer.

use rand::Rng;
use std::time::Duration;

/// Configuration for a [`Synchronizer`](crate::Synchronizer).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Backoff schedule for reopening the change stream after it drops.
    ///
    /// Reconnection never gives up, so `max_attempts` is not consulted here.
    pub reconnect: RetryConfig,
    /// Retry policy for the per-key snapshot taken after a reconnect.
    pub resync_retry: RetryConfig,
    /// Upper bound on a single `open_stream` call.
    pub open_timeout: Duration,
    /// Upper bound on a single snapshot fetch.
    pub fetch_timeout: Duration,
}

impl SyncConfig {
    /// Creates a configuration with default timings.
    pub fn new() -> Self {
        Self {
            reconnect: RetryConfig::new(u32::MAX)
                .with_initial_delay(Duration::from_millis(250))
                .with_max_delay(Duration::from_secs(30)),
            resync_retry: RetryConfig::new(5),
            open_timeout: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(10),
        }
    }

    /// Sets the reconnect backoff schedule.
    pub fn with_reconnect(mut self, reconnect: RetryConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets the retry policy for post-reconnect snapshots.
    pub fn with_resync_retry(mut self, retry: RetryConfig) -> Self {
        self.resync_retry = retry;
        self
    }

    /// Sets the stream open timeout.
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Sets the snapshot fetch timeout.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Backoff schedule shared by reconnect attempts and resync snapshot retries.
///
/// Attempt `0` is the immediate try. Attempt `n` waits
/// `initial_delay * backoff_multiplier^(n-1)`, capped at `max_delay`, plus
/// up to a quarter of that again when jitter is on.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Tries allowed, counting the first. Reconnects ignore this.
    pub max_attempts: u32,
    /// Wait before attempt `1`.
    pub initial_delay: Duration,
    /// Ceiling applied before jitter.
    pub max_delay: Duration,
    /// Growth factor between consecutive attempts.
    pub backoff_multiplier: f64,
    /// Spreads reconnecting clients apart.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Allows `max_attempts` tries, starting at 100ms and doubling up to 30s.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// A single try; a failed resync snapshot is given up at once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the wait before attempt `1`.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the ceiling.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the growth factor.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Turns jitter on or off. Tests turn it off for exact timings.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Whether a resync may try again after `failures` failed fetches.
    pub fn allows_attempt(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }

    /// How long to wait before reconnect or resync attempt `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(step) = attempt.checked_sub(1) else {
            return Duration::ZERO;
        };

        let growth = self.backoff_multiplier.powi(step.min(i32::MAX as u32) as i32);
        let capped = (self.initial_delay.as_secs_f64() * growth).min(self.max_delay.as_secs_f64());
        if !self.add_jitter || capped <= 0.0 {
            return Duration::from_secs_f64(capped);
        }

        let spread = capped * 0.25 * rand::thread_rng().gen::<f64>();
        Duration::from_secs_f64(capped + spread)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new()
            .with_open_timeout(Duration::from_secs(2))
            .with_fetch_timeout(Duration::from_secs(3))
            .with_resync_retry(RetryConfig::no_retry());

        assert_eq!(config.open_timeout, Duration::from_secs(2));
        assert_eq!(config.fetch_timeout, Duration::from_secs(3));
        assert_eq!(config.resync_retry.max_attempts, 1);
        assert_eq!(config.reconnect.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn retry_config_no_retry() {
        let config = RetryConfig::no_retry();
        assert!(config.allows_attempt(0));
        assert!(!config.allows_attempt(1));
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        // First attempt has no delay
        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_without_jitter_is_exact() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0);

        let delay = config.delay_for_attempt(5);
        assert!(delay <= Duration::from_millis(6250)); // 5s + 25% jitter
    }

    #[test]
    fn retry_delay_survives_huge_attempt_numbers() {
        let config = SyncConfig::new().reconnect;
        let delay = config.delay_for_attempt(u32::MAX);
        assert!(delay <= Duration::from_millis(37_500));
    }
}
