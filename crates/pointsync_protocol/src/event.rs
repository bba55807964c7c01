//! Change events and snapshots.

use crate::types::{CounterValue, EntityKey, Timestamp};
use serde::{Deserialize, Serialize};

/// A single authoritative update from the change stream.
///
/// A change event is not a delta: it states the full value of the counter as
/// of `source_timestamp`. Between two events for the same key the one with
/// the larger timestamp wins, regardless of arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Key whose counter changed.
    pub entity_key: EntityKey,
    /// The counter value after the change.
    pub new_value: CounterValue,
    /// Server time at which the value became current.
    pub source_timestamp: Timestamp,
}

impl ChangeEvent {
    /// Creates a change event.
    pub fn new(
        entity_key: impl Into<EntityKey>,
        new_value: CounterValue,
        source_timestamp: impl Into<Timestamp>,
    ) -> Self {
        Self {
            entity_key: entity_key.into(),
            new_value,
            source_timestamp: source_timestamp.into(),
        }
    }

    /// Returns true if this event supersedes state last written at `applied`.
    pub fn supersedes(&self, applied: Timestamp) -> bool {
        self.source_timestamp > applied
    }
}

/// Result of a one-shot baseline read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The committed counter value at read time.
    pub value: CounterValue,
    /// Server time the value was current at, when the store reports one.
    pub as_of: Option<Timestamp>,
}

impl Snapshot {
    /// Creates a snapshot carrying its own timestamp.
    pub fn new(value: CounterValue, as_of: impl Into<Timestamp>) -> Self {
        Self {
            value,
            as_of: Some(as_of.into()),
        }
    }

    /// Creates a snapshot without a server timestamp.
    pub fn untimed(value: CounterValue) -> Self {
        Self { value, as_of: None }
    }

    /// Timestamp the snapshot competes with events under.
    ///
    /// Falls back to `fetched_at` (the local time the read was issued) when
    /// the store did not stamp the value.
    pub fn basis(&self, fetched_at: Timestamp) -> Timestamp {
        self.as_of.unwrap_or(fetched_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_supersedes_only_strictly_newer() {
        let event = ChangeEvent::new("user-1", 7, 20);
        assert!(event.supersedes(Timestamp::from_millis(10)));
        assert!(!event.supersedes(Timestamp::from_millis(20)));
        assert!(!event.supersedes(Timestamp::from_millis(30)));
    }

    #[test]
    fn snapshot_basis_prefers_server_time() {
        let fetched_at = Timestamp::from_millis(500);
        assert_eq!(
            Snapshot::new(5, 10).basis(fetched_at),
            Timestamp::from_millis(10)
        );
        assert_eq!(Snapshot::untimed(5).basis(fetched_at), fetched_at);
    }
}
