//! Core identifiers and scalar types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Accumulated points for one entity.
///
/// Points only grow in normal operation, but the server may issue absolute
/// corrections, so nothing in the protocol assumes monotonic values.
pub type CounterValue = u64;

/// Identifier of a synchronized entity (typically a user ID).
///
/// Keys are opaque: the protocol never interprets their content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(String);

impl EntityKey {
    /// Creates a key from any string-like identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the key is the empty string.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityKey {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EntityKey {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Milliseconds since the Unix epoch, as stamped by the server clock.
///
/// Ordering between two timestamps decides which of two values for the
/// same key is newer.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The earliest representable timestamp.
    pub const ZERO: Timestamp = Timestamp(0);

    /// Creates a timestamp from milliseconds since the epoch.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the epoch.
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Reads the local wall clock.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self(millis)
    }

    /// Returns the next representable timestamp.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(millis: u64) -> Self {
        Self(millis)
    }
}

/// The set of keys a change stream is filtered to.
///
/// Kept sorted so that two filters over the same keys compare and encode
/// identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyFilter(BTreeSet<EntityKey>);

impl KeyFilter {
    /// Creates an empty filter.
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Adds a key. Returns true if it was not already present.
    pub fn insert(&mut self, key: EntityKey) -> bool {
        self.0.insert(key)
    }

    /// Removes a key. Returns true if it was present.
    pub fn remove(&mut self, key: &EntityKey) -> bool {
        self.0.remove(key)
    }

    /// Returns true if the key passes the filter.
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.0.contains(key)
    }

    /// Number of keys in the filter.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the filter matches nothing.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the keys in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &EntityKey> {
        self.0.iter()
    }
}

impl FromIterator<EntityKey> for KeyFilter {
    fn from_iter<I: IntoIterator<Item = EntityKey>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for KeyFilter {
    type Item = EntityKey;
    type IntoIter = std::collections::btree_set::IntoIter<EntityKey>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
