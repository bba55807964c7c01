//! In-memory points ledger.

use crate::error::{ServerError, ServerResult};
use parking_lot::Mutex;
use pointsync_protocol::{ChangeEvent, CounterValue, EntityKey, Snapshot, Timestamp};
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::trace;

struct Ledger {
    balances: HashMap<EntityKey, Snapshot>,
    clock: Timestamp,
}

impl Ledger {
    /// Issues a timestamp strictly after every previous one.
    fn tick(&mut self) -> Timestamp {
        self.clock = Timestamp::now().max(self.clock.next());
        self.clock
    }
}

/// Authoritative store of point balances.
///
/// Every write is stamped with a server timestamp strictly greater than
/// all earlier ones and published to feed subscribers in commit order.
pub struct PointsLedger {
    inner: Mutex<Ledger>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl PointsLedger {
    /// Creates an empty ledger whose feeds buffer `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Mutex::new(Ledger {
                balances: HashMap::new(),
                clock: Timestamp::ZERO,
            }),
            changes,
        }
    }

    /// Adds points to an account, creating it if needed.
    pub fn award(&self, key: impl Into<EntityKey>, amount: CounterValue) -> ChangeEvent {
        let key = key.into();
        let mut ledger = self.inner.lock();
        let balance = ledger.balances.get(&key).map_or(0, |s| s.value);
        self.commit(&mut ledger, key, balance.saturating_add(amount))
    }

    /// Removes points from an account.
    pub fn deduct(&self, key: impl Into<EntityKey>, amount: CounterValue) -> ServerResult<ChangeEvent> {
        let key = key.into();
        let mut ledger = self.inner.lock();
        let balance = ledger.balances.get(&key).map_or(0, |s| s.value);
        if amount > balance {
            return Err(ServerError::InsufficientPoints {
                key,
                balance,
                requested: amount,
            });
        }
        Ok(self.commit(&mut ledger, key, balance - amount))
    }

    /// Sets an absolute balance (administrative correction).
    pub fn set(&self, key: impl Into<EntityKey>, value: CounterValue) -> ChangeEvent {
        let mut ledger = self.inner.lock();
        self.commit(&mut ledger, key.into(), value)
    }

    fn commit(&self, ledger: &mut Ledger, key: EntityKey, value: CounterValue) -> ChangeEvent {
        let at = ledger.tick();
        ledger.balances.insert(key.clone(), Snapshot::new(value, at));
        let event = ChangeEvent::new(key, value, at);
        // Sent under the lock so subscribers see commit order.
        if self.changes.send(event.clone()).is_err() {
            trace!(key = %event.entity_key, "no feeds open");
        }
        event
    }

    /// Returns the committed balance and its timestamp.
    pub fn get(&self, key: &EntityKey) -> Option<Snapshot> {
        self.inner.lock().balances.get(key).copied()
    }

    /// Returns the balance, or zero for unknown accounts.
    pub fn balance(&self, key: &EntityKey) -> CounterValue {
        self.get(key).map_or(0, |s| s.value)
    }

    /// Returns the number of accounts.
    pub fn len(&self) -> usize {
        self.inner.lock().balances.len()
    }

    /// Returns true if no account exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribes to every committed change.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    /// Returns the number of live change subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.changes.receiver_count()
    }
}

impl Default for PointsLedger {
    fn default() -> Self {
        Self::new(1024)
    }
}
