//! Ephemeral per-client presence: who is in the room, where their cursor is.
//!
//! Presence is never part of the document. The server treats payloads as
//! opaque bytes, keeps the latest one per client and forgets clients that
//! stop refreshing it.
//!
//! ```text
//! client cursor move
//!       │
//!       ▼
//! PresenceThrottle::offer()     (at most one payload per interval)
//!       │
//!       ▼  Presence message
//! PresenceTracker::set()        (server, last-write-wins)
//!       │
//!       ▼  PresenceSet message
//! every client in the room
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::protocol::{ClientId, PresenceEntry};

/// Latest presence of one client, as held by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub payload: Vec<u8>,
    pub last_seen: Instant,
}

/// Presence set of one room.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    records: HashMap<ClientId, PresenceRecord>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `payload` as the client's presence (last write wins).
    ///
    /// Returns true when the visible presence set changed.
    pub fn set(&mut self, client_id: ClientId, payload: Vec<u8>, now: Instant) -> bool {
        match self.records.get_mut(&client_id) {
            Some(record) => {
                record.last_seen = now;
                if record.payload == payload {
                    return false;
                }
                record.payload = payload;
                true
            }
            None => {
                self.records.insert(client_id, PresenceRecord { payload, last_seen: now });
                true
            }
        }
    }

    /// Refresh the liveness of a known client without changing its payload.
    pub fn touch(&mut self, client_id: &ClientId, now: Instant) {
        if let Some(record) = self.records.get_mut(client_id) {
            record.last_seen = now;
        }
    }

    pub fn remove(&mut self, client_id: &ClientId) -> bool {
        self.records.remove(client_id).is_some()
    }

    /// Drop every client not refreshed within `ttl`; returns who was dropped.
    pub fn sweep_stale(&mut self, now: Instant, ttl: Duration) -> Vec<ClientId> {
        let stale: Vec<ClientId> = self
            .records
            .iter()
            .filter(|(_, record)| now.saturating_duration_since(record.last_seen) > ttl)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.records.remove(id);
        }
        stale
    }

    pub fn get(&self, client_id: &ClientId) -> Option<&PresenceRecord> {
        self.records.get(client_id)
    }

    /// Current set, ordered by client id so every receiver sees the same list.
    pub fn entries(&self) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self
            .records
            .iter()
            .map(|(id, record)| PresenceEntry {
                client_id: *id,
                payload: record.payload.clone(),
            })
            .collect();
        entries.sort_by_key(|entry| entry.client_id);
        entries
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Typed presence payload used by the bundled client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub name: String,
    /// CSS color string.
    pub color: String,
    /// Cursor as a visible character index.
    pub cursor: Option<usize>,
}

impl PresencePayload {
    /// Default identity for a client: `User<n>` and an HSL color, both stable
    /// for a given id.
    pub fn for_client(client_id: Uuid) -> Self {
        let hash = client_id.as_u128();
        Self {
            name: format!("User{}", hash % 1000),
            color: format!("hsl({}, 70%, 60%)", (hash >> 64) % 360),
            cursor: None,
        }
    }

    pub fn with_cursor(mut self, cursor: Option<usize>) -> Self {
        self.cursor = cursor;
        self
    }

    /// Encode to the opaque bytes carried by `Presence` messages.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let (payload, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| e.to_string())?;
        Ok(payload)
    }
}

/// Client-side debounce for outgoing presence.
///
/// A payload is sent at most once per interval. Payloads offered in between
/// replace each other; the latest one goes out on the next [`flush`].
///
/// [`flush`]: PresenceThrottle::flush
#[derive(Debug)]
pub struct PresenceThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
    pending: Option<Vec<u8>>,
}

impl PresenceThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
            pending: None,
        }
    }

    /// Offer a payload. Returns it back if it may be sent right now;
    /// otherwise it is held until the interval has elapsed.
    pub fn offer(&mut self, payload: Vec<u8>, now: Instant) -> Option<Vec<u8>> {
        if self.ready(now) {
            self.last_sent = Some(now);
            self.pending = None;
            Some(payload)
        } else {
            self.pending = Some(payload);
            None
        }
    }

    /// Release the held payload once the interval allows it.
    pub fn flush(&mut self, now: Instant) -> Option<Vec<u8>> {
        if self.pending.is_some() && self.ready(now) {
            self.last_sent = Some(now);
            return self.pending.take();
        }
        None
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn ready(&self, now: Instant) -> bool {
        self.last_sent
            .is_none_or(|sent| now.saturating_duration_since(sent) >= self.interval)
    }
}
