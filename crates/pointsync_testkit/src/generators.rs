//! Property-based test generators using proptest.
//!
//! Provides strategies for generating keys, events and whole subscription
//! scenarios, plus a reference model of last-writer-wins reconciliation.

use pointsync_protocol::{ChangeEvent, CounterValue, EntityKey, Timestamp};
use proptest::prelude::*;
use std::collections::HashMap;

/// Strategy for generating valid entity keys.
pub fn entity_key_strategy() -> impl Strategy<Value = EntityKey> {
    prop::string::string_regex("[a-z][a-z0-9_-]{0,15}")
        .expect("Invalid regex")
        .prop_map(EntityKey::from)
}

/// Strategy for picking one of a fixed set of keys.
pub fn key_from(keys: &[&str]) -> impl Strategy<Value = EntityKey> {
    let keys: Vec<EntityKey> = keys.iter().copied().map(EntityKey::from).collect();
    prop::sample::select(keys)
}

/// Strategy for timestamps in a small range, so duplicates and reorders occur.
pub fn timestamp_strategy() -> impl Strategy<Value = Timestamp> {
    (0u64..500).prop_map(Timestamp::from_millis)
}

/// Strategy for change events on the given keys.
pub fn change_event_strategy(keys: &[&str]) -> impl Strategy<Value = ChangeEvent> {
    (key_from(keys), 0u64..10_000, timestamp_strategy())
        .prop_map(|(key, value, ts)| ChangeEvent::new(key, value, ts))
}

/// Strategy for an arbitrarily ordered event sequence.
pub fn event_sequence_strategy(
    keys: &[&str],
    max_len: usize,
) -> impl Strategy<Value = Vec<ChangeEvent>> {
    prop::collection::vec(change_event_strategy(keys), 0..max_len)
}

/// A step in a generated subscription scenario.
#[derive(Debug, Clone)]
pub enum SyncStep {
    /// Subscribe to a key.
    Subscribe(EntityKey),
    /// Drop the n-th live handle (modulo the number of handles).
    Unsubscribe(usize),
    /// Deliver an event on the change stream.
    Event(ChangeEvent),
    /// Cut every open stream.
    Sever,
}

/// Strategy for scenario steps on the given keys.
pub fn sync_step_strategy(keys: &[&str]) -> impl Strategy<Value = SyncStep> {
    prop_oneof![
        3 => key_from(keys).prop_map(SyncStep::Subscribe),
        2 => any::<usize>().prop_map(SyncStep::Unsubscribe),
        4 => change_event_strategy(keys).prop_map(SyncStep::Event),
        1 => Just(SyncStep::Sever),
    ]
}

/// Strategy for a whole scenario.
pub fn scenario_strategy(keys: &[&str], max_steps: usize) -> impl Strategy<Value = Vec<SyncStep>> {
    prop::collection::vec(sync_step_strategy(keys), 1..max_steps)
}

/// Reference model: per-key value after applying `events` over `initial`.
///
/// A value is replaced only by a strictly newer timestamp; on ties the first
/// arrival is kept.
pub fn expected_latest(
    initial: &HashMap<EntityKey, (CounterValue, Timestamp)>,
    events: &[ChangeEvent],
) -> HashMap<EntityKey, (CounterValue, Timestamp)> {
    let mut state = initial.clone();
    for event in events {
        let entry = state
            .entry(event.entity_key.clone())
            .or_insert((0, Timestamp::ZERO));
        if event.source_timestamp > entry.1 {
            *entry = (event.new_value, event.source_timestamp);
        }
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn generated_keys_are_valid(key in entity_key_strategy()) {
            prop_assert!(!key.is_empty());
            prop_assert!(key.as_str().len() <= 16);
        }

        #[test]
        fn events_use_given_keys(events in event_sequence_strategy(&["a", "b"], 20)) {
            for event in events {
                prop_assert!(event.entity_key.as_str() == "a" || event.entity_key.as_str() == "b");
            }
        }

        #[test]
        fn model_is_order_insensitive_for_distinct_timestamps(
            events in event_sequence_strategy(&["a"], 20),
        ) {
            let mut distinct = Vec::new();
            for event in events {
                if !distinct.iter().any(|e: &ChangeEvent| e.source_timestamp == event.source_timestamp) {
                    distinct.push(event);
                }
            }
            let mut reversed = distinct.clone();
            reversed.reverse();

            let initial = HashMap::new();
            prop_assert_eq!(
                expected_latest(&initial, &distinct),
                expected_latest(&initial, &reversed)
            );
        }
    }

    #[test]
    fn model_keeps_first_on_ties() {
        let events = vec![
            ChangeEvent::new("a", 1, 10),
            ChangeEvent::new("a", 2, 10),
            ChangeEvent::new("a", 3, 5),
        ];
        let result = expected_latest(&HashMap::new(), &events);
        assert_eq!(result[&EntityKey::from("a")], (1, Timestamp::from_millis(10)));
    }
}
