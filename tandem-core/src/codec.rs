//! Binary update codec and differential sync.
//!
//! Wire format of one update frame:
//! ```text
//! ┌─────────┬────────────┬──────────────────────────────┐
//! │ version │ body_len   │ body (bincode WireUpdate)    │
//! │ 1 byte  │ 4 bytes LE │ body_len bytes               │
//! └─────────┴────────────┴──────────────────────────────┘
//! ```
//!
//! Frames can be concatenated on one connection and split again with
//! [`decode_stream`]. Inside the body, items typed in one go travel as runs
//! (one id, one origin, one `String`) and deletions as per-replica counter
//! ranges, so a pasted paragraph costs a few bytes of header, not one
//! header per character.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::CoreError;
use crate::id::{ItemId, ReplicaId, StateVector};
use crate::text::{DeleteSet, Document, Item, Update};

/// Current frame version.
pub const FORMAT_VERSION: u8 = 1;

/// Version byte + body length.
pub const HEADER_LEN: usize = 5;

/// Upper bound on the ids a single delete range may expand to.
const MAX_DELETE_RANGE: u64 = 1 << 20;

/// Upper bound on the ids all delete ranges of one frame expand to together.
pub const MAX_FRAME_DELETES: u64 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WireRun {
    id: ItemId,
    origin: Option<ItemId>,
    content: String,
    deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WireDeleteRange {
    replica: ReplicaId,
    start: u64,
    len: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WireUpdate {
    runs: Vec<WireRun>,
    deletes: Vec<WireDeleteRange>,
}

/// Serialize an update into a single self-delimiting frame.
pub fn encode_update(update: &Update) -> Result<Vec<u8>, CoreError> {
    let wire = WireUpdate {
        runs: to_runs(&update.items),
        deletes: to_ranges(&update.deletes),
    };
    let body = bincode::serde::encode_to_vec(&wire, bincode::config::standard())
        .map_err(|e| CoreError::Encode(e.to_string()))?;
    let body_len = u32::try_from(body.len())
        .map_err(|_| CoreError::Encode(format!("body of {} bytes exceeds frame limit", body.len())))?;

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.push(FORMAT_VERSION);
    frame.extend_from_slice(&body_len.to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode exactly one frame. Trailing bytes are an error.
pub fn decode_update(bytes: &[u8]) -> Result<Update, CoreError> {
    let (update, consumed) = read_frame(bytes)?;
    if consumed != bytes.len() {
        return Err(CoreError::malformed(format!(
            "{} trailing bytes after frame",
            bytes.len() - consumed
        )));
    }
    Ok(update)
}

/// Decode a sequence of concatenated frames.
///
/// Fails as a whole if any frame is malformed.
pub fn decode_stream(mut bytes: &[u8]) -> Result<Vec<Update>, CoreError> {
    let mut updates = Vec::new();
    while !bytes.is_empty() {
        let (update, consumed) = read_frame(bytes)?;
        updates.push(update);
        bytes = &bytes[consumed..];
    }
    Ok(updates)
}

/// Items the peer has not seen yet, plus every deletion it might lack.
pub fn diff_since(doc: &Document, peer: &StateVector) -> Update {
    let mut update = Update::new();
    for item in doc.items() {
        if peer.covers(item.id) {
            if item.deleted {
                update.deletes.insert(item.id);
            }
        } else {
            update.items.push(item.clone());
        }
    }
    update
}

/// Per-replica maximum of two state vectors.
pub fn merge_state_vectors(a: &StateVector, b: &StateVector) -> StateVector {
    let mut merged = a.clone();
    for (replica, counter) in b.iter() {
        merged.observe(ItemId::new(replica, counter));
    }
    merged
}

fn read_frame(bytes: &[u8]) -> Result<(Update, usize), CoreError> {
    if bytes.len() < HEADER_LEN {
        return Err(CoreError::malformed("truncated frame header"));
    }
    if bytes[0] != FORMAT_VERSION {
        return Err(CoreError::malformed(format!(
            "unsupported frame version {}",
            bytes[0]
        )));
    }
    let body_len = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    let end = HEADER_LEN
        .checked_add(body_len)
        .ok_or_else(|| CoreError::malformed("frame length overflow"))?;
    if bytes.len() < end {
        return Err(CoreError::malformed(format!(
            "truncated body: expected {body_len} bytes, got {}",
            bytes.len() - HEADER_LEN
        )));
    }

    let body = &bytes[HEADER_LEN..end];
    let (wire, read): (WireUpdate, usize) =
        bincode::serde::decode_from_slice(body, bincode::config::standard())
            .map_err(|e| CoreError::malformed(e.to_string()))?;
    if read != body.len() {
        return Err(CoreError::malformed("frame body has trailing bytes"));
    }

    Ok((from_wire(wire)?, end))
}

fn to_runs(items: &[Item]) -> Vec<WireRun> {
    let mut runs: Vec<WireRun> = Vec::new();
    let mut last: Option<ItemId> = None;

    for item in items {
        if let (Some(run), Some(prev)) = (runs.last_mut(), last) {
            let continues = run.deleted == item.deleted
                && item.id.replica == prev.replica
                && item.id.counter == prev.counter + 1
                && item.origin == Some(prev);
            if continues {
                run.content.push(item.value);
                last = Some(item.id);
                continue;
            }
        }
        runs.push(WireRun {
            id: item.id,
            origin: item.origin,
            content: item.value.to_string(),
            deleted: item.deleted,
        });
        last = Some(item.id);
    }
    runs
}

fn to_ranges(deletes: &DeleteSet) -> Vec<WireDeleteRange> {
    let mut by_replica: BTreeMap<ReplicaId, Vec<u64>> = BTreeMap::new();
    for id in deletes.iter() {
        by_replica.entry(id.replica).or_default().push(id.counter);
    }

    let mut ranges = Vec::new();
    for (replica, mut counters) in by_replica {
        counters.sort_unstable();
        let mut current: Option<WireDeleteRange> = None;
        for counter in counters {
            match current.as_mut() {
                Some(r) if r.start + r.len == counter => r.len += 1,
                _ => {
                    if let Some(done) = current.take() {
                        ranges.push(done);
                    }
                    current = Some(WireDeleteRange { replica, start: counter, len: 1 });
                }
            }
        }
        ranges.extend(current);
    }
    ranges
}

fn from_wire(wire: WireUpdate) -> Result<Update, CoreError> {
    let mut update = Update::new();

    for run in wire.runs {
        if run.content.is_empty() {
            return Err(CoreError::malformed(format!("empty run at {}", run.id)));
        }
        // Lamport ids: an item always ranks above the item it was typed after.
        if let Some(origin) = run.origin.filter(|o| o.counter >= run.id.counter) {
            return Err(CoreError::malformed(format!(
                "run {} does not follow its origin {origin}",
                run.id
            )));
        }
        let mut origin = run.origin;
        for (offset, value) in run.content.chars().enumerate() {
            let counter = run
                .id
                .counter
                .checked_add(offset as u64)
                .ok_or_else(|| CoreError::malformed("run counter overflow"))?;
            let id = ItemId::new(run.id.replica, counter);
            update.items.push(Item {
                id,
                origin,
                value,
                deleted: run.deleted,
            });
            origin = Some(id);
        }
    }

    let mut delete_total: u64 = 0;
    for range in wire.deletes {
        if range.len == 0 || range.len > MAX_DELETE_RANGE {
            return Err(CoreError::malformed(format!(
                "invalid delete range length {}",
                range.len
            )));
        }
        delete_total += range.len;
        if delete_total > MAX_FRAME_DELETES {
            return Err(CoreError::malformed(format!(
                "frame deletes more than {MAX_FRAME_DELETES} ids"
            )));
        }
        let end = range
            .start
            .checked_add(range.len)
            .ok_or_else(|| CoreError::malformed("delete range overflow"))?;
        update
            .deletes
            .extend((range.start..end).map(|c| ItemId::new(range.replica, c)));
    }

    Ok(update)
}
