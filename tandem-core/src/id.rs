//! Identifiers and clocks.
//!
//! Every character ever inserted gets an [`ItemId`]: the author's
//! [`ReplicaId`] plus a counter from the author's [`Clock`]. Ids compare by
//! `(counter, replica)`, which is the tie-break order for concurrent
//! insertions at the same position.
//!
//! The clock is Lamport-style: integrating a remote item lifts the local
//! counter past the remote one. An item therefore always compares greater
//! than every item its author had already seen, including its origin.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Identity of one replica (one editing session of one participant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId(pub u64);

impl ReplicaId {
    /// Fresh random replica id, derived from a v4 UUID.
    pub fn random() -> Self {
        Self::from_uuid(Uuid::new_v4())
    }

    /// Stable replica id for a given UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        let (hi, lo) = id.as_u64_pair();
        Self(hi ^ lo)
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Globally unique identifier of a single item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId {
    pub replica: ReplicaId,
    pub counter: u64,
}

impl ItemId {
    pub fn new(replica: ReplicaId, counter: u64) -> Self {
        Self { replica, counter }
    }
}

impl Ord for ItemId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then_with(|| self.replica.cmp(&other.replica))
    }
}

impl PartialOrd for ItemId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.replica)
    }
}

/// Per-replica monotonic counter.
#[derive(Debug, Clone)]
pub struct Clock {
    replica: ReplicaId,
    counter: u64,
}

impl Clock {
    pub fn new(replica: ReplicaId) -> Self {
        Self { replica, counter: 0 }
    }

    /// Allocate the next id. Strictly increasing for this replica.
    pub fn next_id(&mut self) -> ItemId {
        let id = ItemId::new(self.replica, self.counter);
        self.counter += 1;
        id
    }

    /// Make sure the next id sorts above `counter`.
    pub fn observe(&mut self, counter: u64) {
        if counter >= self.counter {
            self.counter = counter.saturating_add(1);
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Counter the next allocated id will carry.
    pub fn peek(&self) -> u64 {
        self.counter
    }
}

/// Highest integrated counter per replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(BTreeMap<ReplicaId, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, replica: ReplicaId) -> Option<u64> {
        self.0.get(&replica).copied()
    }

    /// Record that `id` has been integrated.
    pub fn observe(&mut self, id: ItemId) {
        let entry = self.0.entry(id.replica).or_insert(id.counter);
        if id.counter > *entry {
            *entry = id.counter;
        }
    }

    /// Whether the peer owning this vector has already seen `id`.
    pub fn covers(&self, id: ItemId) -> bool {
        self.get(id.replica).is_some_and(|c| id.counter <= c)
    }

    pub fn set(&mut self, replica: ReplicaId, counter: u64) {
        self.0.insert(replica, counter);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, u64)> + '_ {
        self.0.iter().map(|(r, c)| (*r, *c))
    }
}

impl FromIterator<(ReplicaId, u64)> for StateVector {
    fn from_iter<T: IntoIterator<Item = (ReplicaId, u64)>>(iter: T) -> Self {
        let mut sv = StateVector::new();
        for (replica, counter) in iter {
            sv.observe(ItemId::new(replica, counter));
        }
        sv
    }
}
