//! Replicated text document.
//!
//! The document is a flat sequence of single-character [`Item`]s. Each item
//! remembers the item it was typed after (its *origin*). Deleted items stay
//! in the sequence as tombstones so later items can still reference them.
//!
//! ## Placement rule
//!
//! A new item goes right after its origin, then moves right past every item
//! whose id is greater than its own:
//!
//! ```text
//!   origin ─► [C1 > new] [C1's descendants] │ insert here │ [C2 < new] ...
//! ```
//!
//! Siblings sharing an origin end up in descending id order, and since the
//! clock is Lamport-style, the descendants of a sibling always carry larger
//! ids than the sibling itself. Every replica that has integrated the same
//! set of items therefore holds the same sequence, whatever order the items
//! arrived in.
//!
//! Items whose origin is unknown are parked until the origin arrives.
//! Deletions of unknown ids are parked too and applied on arrival.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::id::{Clock, ItemId, ReplicaId, StateVector};

/// A single character with its identity and position anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    /// Item this one was inserted after at creation time. `None` = document start.
    pub origin: Option<ItemId>,
    pub value: char,
    /// Tombstone flag.
    pub deleted: bool,
}

impl Item {
    pub fn is_visible(&self) -> bool {
        !self.deleted
    }
}

/// Set of tombstoned item ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSet(BTreeSet<ItemId>);

impl DeleteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ItemId) -> bool {
        self.0.insert(id)
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.0.contains(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Ids in `(counter, replica)` order.
    pub fn iter(&self) -> impl Iterator<Item = ItemId> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<ItemId> for DeleteSet {
    fn from_iter<T: IntoIterator<Item = ItemId>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<ItemId> for DeleteSet {
    fn extend<T: IntoIterator<Item = ItemId>>(&mut self, iter: T) {
        self.0.extend(iter)
    }
}

/// Unit of exchange between replicas: new items plus deletions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Update {
    pub items: Vec<Item>,
    pub deletes: DeleteSet,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items(items: Vec<Item>) -> Self {
        Self { items, deletes: DeleteSet::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.deletes.is_empty()
    }

    /// Append another update's content.
    pub fn extend(&mut self, other: Update) {
        self.items.extend(other.items);
        self.deletes.extend(other.deletes.iter());
    }
}

/// What a merge did to the document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Items placed into the sequence (including previously buffered ones).
    pub integrated: usize,
    /// Items parked because their origin is still missing.
    pub buffered: usize,
    /// Items newly tombstoned.
    pub deleted: usize,
}

impl MergeOutcome {
    /// Whether the visible state may have changed.
    pub fn changed(&self) -> bool {
        self.integrated > 0 || self.deleted > 0
    }
}

/// A buffered item dropped because its origin never showed up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanedOp {
    pub id: ItemId,
    pub missing_origin: ItemId,
    pub waited: Duration,
}

/// Upper bound on deletions held for items not seen yet.
pub const MAX_PARKED_DELETES: usize = 1 << 16;

#[derive(Debug, Clone)]
struct Pending {
    item: Item,
    buffered_at: Instant,
}

/// The replicated text document.
#[derive(Debug, Clone)]
pub struct Document {
    clock: Clock,
    items: Vec<Item>,
    known: HashSet<ItemId>,
    state_vector: StateVector,
    /// Items waiting for their origin, keyed by the missing origin.
    pending: HashMap<ItemId, Vec<Pending>>,
    pending_ids: HashSet<ItemId>,
    /// Deletions that arrived before their item, with arrival time.
    parked_deletes: HashMap<ItemId, Instant>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// Empty document with a random replica id.
    pub fn new() -> Self {
        Self::with_replica(ReplicaId::random())
    }

    pub fn with_replica(replica: ReplicaId) -> Self {
        Self {
            clock: Clock::new(replica),
            items: Vec::new(),
            known: HashSet::new(),
            state_vector: StateVector::new(),
            pending: HashMap::new(),
            pending_ids: HashSet::new(),
            parked_deletes: HashMap::new(),
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.clock.replica()
    }

    // ── Local edits ─────────────────────────────────────────────────

    /// Insert `value` after `after` (`None` = at the start).
    ///
    /// If `after` is not known yet the item is buffered like a remote one.
    pub fn insert(&mut self, after: Option<ItemId>, value: char) -> Item {
        if let Some(origin) = after {
            self.clock.observe(origin.counter);
        }
        let item = Item {
            id: self.clock.next_id(),
            origin: after,
            value,
            deleted: false,
        };
        self.merge_item(item.clone(), Instant::now());
        item
    }

    /// Insert a run of characters, each anchored on the previous one.
    pub fn insert_text(&mut self, after: Option<ItemId>, text: &str) -> Vec<Item> {
        let mut origin = after;
        let mut created = Vec::with_capacity(text.chars().count());
        for ch in text.chars() {
            let item = self.insert(origin, ch);
            origin = Some(item.id);
            created.push(item);
        }
        created
    }

    /// Tombstone an item. Idempotent.
    ///
    /// Returns `false` when the id is not integrated yet. Unlike a remote
    /// delete, which is parked until its item arrives, a local delete of an
    /// unknown or still-buffered id is dropped and never reaches peers.
    pub fn delete(&mut self, id: ItemId) -> bool {
        match self.position_of(id) {
            Some(pos) => {
                self.items[pos].deleted = true;
                true
            }
            None => false,
        }
    }

    /// Insert `text` at a visible character index (clamped to the length).
    pub fn insert_at(&mut self, index: usize, text: &str) -> Update {
        let after = match index.min(self.visible_len()) {
            0 => None,
            n => self.id_at(n - 1),
        };
        Update::from_items(self.insert_text(after, text))
    }

    /// Delete `len` visible characters starting at `index`.
    pub fn delete_range(&mut self, index: usize, len: usize) -> Update {
        let targets: Vec<ItemId> = self
            .items
            .iter()
            .filter(|i| i.is_visible())
            .skip(index)
            .take(len)
            .map(|i| i.id)
            .collect();

        let mut update = Update::new();
        for id in targets {
            self.delete(id);
            update.deletes.insert(id);
        }
        update
    }

    /// Replace the visible text with `text`.
    ///
    /// Only the span between the common prefix and common suffix is
    /// rewritten, so concurrent edits elsewhere in the buffer survive.
    pub fn replace_all(&mut self, text: &str) -> Update {
        let current: Vec<char> = self.to_visible_text().chars().collect();
        let next: Vec<char> = text.chars().collect();

        let prefix = current
            .iter()
            .zip(next.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let max_suffix = current.len().min(next.len()) - prefix;
        let suffix = current
            .iter()
            .rev()
            .zip(next.iter().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();

        let removed = current.len() - prefix - suffix;
        let inserted: String = next[prefix..next.len() - suffix].iter().collect();

        let mut update = self.delete_range(prefix, removed);
        if !inserted.is_empty() {
            update.extend(self.insert_at(prefix, &inserted));
        }
        update
    }

    // ── Remote merge ────────────────────────────────────────────────

    /// Integrate remote items. Returns how many were placed.
    pub fn merge_remote(&mut self, items: &[Item]) -> usize {
        let now = Instant::now();
        items
            .iter()
            .map(|item| self.merge_item(item.clone(), now).integrated)
            .sum()
    }

    /// Integrate a full update: items first, then deletions.
    pub fn merge_update(&mut self, update: &Update) -> MergeOutcome {
        let now = Instant::now();
        let mut outcome = MergeOutcome::default();
        for item in &update.items {
            let step = self.merge_item(item.clone(), now);
            outcome.integrated += step.integrated;
            outcome.buffered += step.buffered;
            outcome.deleted += step.deleted;
        }
        for id in update.deletes.iter() {
            outcome.deleted += self.apply_remote_delete(id, now);
        }
        outcome
    }

    fn merge_item(&mut self, item: Item, now: Instant) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        if self.known.contains(&item.id) {
            if item.deleted {
                outcome.deleted += self.apply_remote_delete(item.id, now);
            }
            return outcome;
        }
        if self.pending_ids.contains(&item.id) {
            if item.deleted {
                self.park_delete(item.id, now);
            }
            return outcome;
        }
        if let Some(origin) = item.origin.filter(|o| o.counter >= item.id.counter) {
            log::warn!("skipping {}: id does not rank above origin {}", item.id, origin);
            return outcome;
        }

        if let Some(origin) = item.origin {
            if !self.known.contains(&origin) {
                log::trace!("buffering {} until origin {} arrives", item.id, origin);
                self.clock.observe(item.id.counter);
                self.pending_ids.insert(item.id);
                self.pending
                    .entry(origin)
                    .or_default()
                    .push(Pending { item, buffered_at: now });
                outcome.buffered += 1;
                return outcome;
            }
        }

        // Place the item, then release anything that was waiting on it.
        let mut ready = vec![item];
        while let Some(next) = ready.pop() {
            let id = next.id;
            if self.integrate(next) {
                outcome.integrated += 1;
                if let Some(waiting) = self.pending.remove(&id) {
                    for p in waiting {
                        self.pending_ids.remove(&p.item.id);
                        ready.push(p.item);
                    }
                }
            }
        }
        outcome
    }

    fn integrate(&mut self, mut item: Item) -> bool {
        let mut pos = match item.origin {
            None => 0,
            Some(origin) => match self.position_of(origin) {
                Some(p) => p + 1,
                None => return false,
            },
        };
        while pos < self.items.len() && self.items[pos].id > item.id {
            pos += 1;
        }

        if self.parked_deletes.remove(&item.id).is_some() {
            item.deleted = true;
        }
        self.clock.observe(item.id.counter);
        self.state_vector.observe(item.id);
        self.known.insert(item.id);
        self.items.insert(pos, item);
        true
    }

    fn apply_remote_delete(&mut self, id: ItemId, now: Instant) -> usize {
        match self.position_of(id) {
            Some(pos) if !self.items[pos].deleted => {
                self.items[pos].deleted = true;
                1
            }
            Some(_) => 0,
            None => {
                self.park_delete(id, now);
                0
            }
        }
    }

    fn park_delete(&mut self, id: ItemId, now: Instant) {
        if self.parked_deletes.len() >= MAX_PARKED_DELETES
            && !self.parked_deletes.contains_key(&id)
        {
            log::warn!("parked delete limit reached, dropping delete of {id}");
            return;
        }
        self.parked_deletes.entry(id).or_insert(now);
    }

    /// Forget deletions whose item did not arrive within `max_age`.
    ///
    /// Returns how many were dropped.
    pub fn drop_stale_deletes(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.parked_deletes.len();
        self.parked_deletes
            .retain(|_, parked_at| now.saturating_duration_since(*parked_at) < max_age);
        before - self.parked_deletes.len()
    }

    /// Discard buffered items that waited longer than `max_age`.
    pub fn drop_orphans(&mut self, now: Instant, max_age: Duration) -> Vec<OrphanedOp> {
        let mut dropped = Vec::new();
        for (origin, waiting) in self.pending.iter_mut() {
            waiting.retain(|p| {
                let waited = now.saturating_duration_since(p.buffered_at);
                if waited >= max_age {
                    dropped.push(OrphanedOp {
                        id: p.item.id,
                        missing_origin: *origin,
                        waited,
                    });
                    false
                } else {
                    true
                }
            });
        }
        self.pending.retain(|_, waiting| !waiting.is_empty());
        for orphan in &dropped {
            self.pending_ids.remove(&orphan.id);
        }
        dropped
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub fn to_visible_text(&self) -> String {
        self.items
            .iter()
            .filter(|i| i.is_visible())
            .map(|i| i.value)
            .collect()
    }

    pub fn visible_len(&self) -> usize {
        self.items.iter().filter(|i| i.is_visible()).count()
    }

    /// Id of the visible character at `index`.
    pub fn id_at(&self, index: usize) -> Option<ItemId> {
        self.items
            .iter()
            .filter(|i| i.is_visible())
            .nth(index)
            .map(|i| i.id)
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.known.contains(&id)
    }

    pub fn get(&self, id: ItemId) -> Option<&Item> {
        self.position_of(id).map(|pos| &self.items[pos])
    }

    /// All integrated items in document order, tombstones included.
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Number of integrated items, tombstones included.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.state_vector
    }

    /// Every integrated item, in document order.
    ///
    /// Origins always precede their dependents, so merging a snapshot never
    /// buffers.
    pub fn snapshot(&self) -> Update {
        Update::from_items(self.items.clone())
    }

    pub fn pending_len(&self) -> usize {
        self.pending_ids.len()
    }

    pub fn parked_deletes_len(&self) -> usize {
        self.parked_deletes.len()
    }

    fn position_of(&self, id: ItemId) -> Option<usize> {
        if !self.known.contains(&id) {
            return None;
        }
        self.items.iter().position(|i| i.id == id)
    }
}
