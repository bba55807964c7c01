//! Scenario runner.
//!
//! Replays a sequence of [`SyncStep`]s against a mock-backed synchronizer
//! while a model store records every write, then checks that the
//! synchronizer settled on the store's values.

use crate::fixtures::{eventually, TestSync};
use crate::generators::SyncStep;
use pointsync_engine::{Snapshot, SubscriptionHandle, Timestamp};
use pointsync_protocol::{CounterValue, EntityKey};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Outcome of a scenario run.
#[derive(Debug, Clone, Default)]
pub struct ScenarioOutcome {
    /// Steps executed.
    pub steps: usize,
    /// Handles alive at the end.
    pub live_handles: usize,
    /// Whether every live handle matched the store before the deadline.
    pub converged: bool,
    /// Invariant violations observed along the way.
    pub violations: Vec<String>,
}

impl ScenarioOutcome {
    /// Returns true if the run converged without violations.
    pub fn is_ok(&self) -> bool {
        self.converged && self.violations.is_empty()
    }
}

/// Authoritative store behind the mock fetcher.
#[derive(Default)]
struct ModelStore {
    values: HashMap<EntityKey, (CounterValue, Timestamp)>,
}

impl ModelStore {
    fn write(&mut self, key: &EntityKey, value: CounterValue, ts: Timestamp) -> bool {
        let current = self.values.get(key).map_or(Timestamp::ZERO, |v| v.1);
        if ts > current {
            self.values.insert(key.clone(), (value, ts));
            true
        } else {
            false
        }
    }

    fn get(&self, key: &EntityKey) -> (CounterValue, Timestamp) {
        self.values.get(key).copied().unwrap_or((0, Timestamp::ZERO))
    }
}

/// Runs `steps` and waits up to `settle` for convergence.
pub async fn run_scenario(steps: &[SyncStep], settle: Duration) -> ScenarioOutcome {
    let harness = TestSync::new();
    let mut store = ModelStore::default();
    let mut handles: Vec<SubscriptionHandle> = Vec::new();
    let mut last_seen: Vec<Timestamp> = Vec::new();
    let mut outcome = ScenarioOutcome::default();

    for step in steps {
        match step {
            SyncStep::Subscribe(key) => match harness.subscribe(key.clone()).await {
                Ok(handle) => {
                    last_seen.push(handle.observed().timestamp);
                    handles.push(handle);
                }
                Err(e) => outcome.violations.push(format!("subscribe {key} failed: {e}")),
            },
            SyncStep::Unsubscribe(n) if !handles.is_empty() => {
                let index = n % handles.len();
                handles.swap_remove(index).unsubscribe();
                last_seen.swap_remove(index);
            }
            SyncStep::Unsubscribe(_) => {}
            SyncStep::Event(event) => {
                if store.write(&event.entity_key, event.new_value, event.source_timestamp) {
                    harness.fetcher.set(
                        event.entity_key.clone(),
                        Snapshot::new(event.new_value, event.source_timestamp),
                    );
                }
                harness.transport.push(event.clone());
            }
            SyncStep::Sever => harness.transport.sever_all(),
        }
        tokio::task::yield_now().await;
        outcome.steps += 1;

        for (handle, last) in handles.iter().zip(last_seen.iter_mut()) {
            let now = handle.observed().timestamp;
            if now < *last {
                outcome.violations.push(format!(
                    "{} went back from {last} to {now}",
                    handle.key()
                ));
            }
            *last = now;
        }
    }

    outcome.live_handles = handles.len();
    outcome.converged = eventually(settle, || {
        handles.iter().all(|handle| {
            let observed = handle.observed();
            handle.is_stream_connected()
                && (observed.value, observed.timestamp) == store.get(handle.key())
        })
    })
    .await;

    let expected: BTreeSet<&EntityKey> = handles.iter().map(|h| h.key()).collect();
    if harness.active_keys() != expected.len() {
        outcome.violations.push(format!(
            "{} keys active, {} subscribed",
            harness.active_keys(),
            expected.len()
        ));
    }
    for key in &expected {
        let subscribed = handles.iter().filter(|h| h.key() == *key).count();
        match harness.state(key) {
            Some(state) if state.subscriber_count == subscribed => {}
            Some(state) => outcome.violations.push(format!(
                "{key} has {} subscribers, expected {subscribed}",
                state.subscriber_count
            )),
            None => outcome.violations.push(format!("{key} has no state")),
        }
    }
    let watched_settled = eventually(settle, || {
        let watched = harness.watched_keys();
        watched.len() == expected.len() && expected.iter().all(|k| watched.contains(k))
    })
    .await;
    if !watched_settled {
        outcome
            .violations
            .push("watched keys do not match subscribed keys".to_string());
    }

    drop(handles);
    harness.teardown().await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::scenario_strategy;
    use pointsync_engine::ChangeEvent;
    use proptest::prelude::*;

    fn key(name: &str) -> EntityKey {
        EntityKey::from(name)
    }

    #[tokio::test]
    async fn scripted_scenario_converges() {
        let steps = vec![
            SyncStep::Event(ChangeEvent::new("a", 5, 10)),
            SyncStep::Subscribe(key("a")),
            SyncStep::Subscribe(key("b")),
            SyncStep::Event(ChangeEvent::new("a", 6, 20)),
            SyncStep::Sever,
            SyncStep::Event(ChangeEvent::new("b", 1, 30)),
            SyncStep::Event(ChangeEvent::new("a", 4, 15)),
            SyncStep::Unsubscribe(1),
        ];

        let outcome = run_scenario(&steps, Duration::from_secs(5)).await;
        assert!(outcome.is_ok(), "{outcome:?}");
        assert_eq!(outcome.steps, steps.len());
        assert_eq!(outcome.live_handles, 1);
    }

    #[tokio::test]
    async fn empty_scenario_is_trivially_ok() {
        let outcome = run_scenario(&[], Duration::from_millis(50)).await;
        assert!(outcome.is_ok());
        assert_eq!(outcome.live_handles, 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn generated_scenarios_converge(steps in scenario_strategy(&["a", "b", "c"], 40)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let outcome = runtime.block_on(run_scenario(&steps, Duration::from_secs(5)));
            prop_assert!(outcome.is_ok(), "{:?}", outcome);
        }
    }
}
