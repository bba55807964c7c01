//! Local time source used to stamp untimed snapshots.

use parking_lot::Mutex;
use pointsync_protocol::Timestamp;

/// A source of local timestamps.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current local time.
    fn now(&self) -> Timestamp;
}

/// Wall-clock time from the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    /// Creates a clock reading `start`.
    pub fn new(start: impl Into<Timestamp>) -> Self {
        Self {
            now: Mutex::new(start.into()),
        }
    }

    /// Sets the current reading.
    pub fn set(&self, now: impl Into<Timestamp>) {
        *self.now.lock() = now.into();
    }

    /// Moves the clock forward by `millis`.
    pub fn advance(&self, millis: u64) {
        let mut now = self.now.lock();
        *now = Timestamp::from_millis(now.as_millis().saturating_add(millis));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock()
    }
}
