//! Room registry: one authoritative document per room, its clients and
//! their presence.
//!
//! ```text
//! SessionManager
//!   └─ RwLock<HashMap<RoomId, Arc<Mutex<Room>>>>
//!                                  │
//!                                  ├─ Document        (authoritative replica)
//!                                  ├─ BroadcastGroup  (bounded queue per client)
//!                                  ├─ PresenceTracker
//!                                  ├─ broadcast::Sender<RoomEvent>
//!                                  └─ sweeper task    (presence TTL, orphans)
//! ```
//!
//! The map lock is only held to look up, insert or remove a room. All
//! mutation of a room happens under that room's own mutex, so rooms never
//! contend with each other. A room whose last client leaves is marked
//! closed under its lock and then dropped from the map; a join racing with
//! that removal sees the flag and retries on a fresh room.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tandem_core::{
    decode_update, diff_since, encode_update, Document, MergeOutcome, StateVector, Update,
};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::broadcast::{BroadcastGroup, BroadcastStats, ClientHandle, ConnectionId, Outbound};
use crate::error::CollabError;
use crate::presence::PresenceTracker;
use crate::protocol::{ClientId, PresenceEntry, RoomId, SnapshotPayload, SyncMessage};

/// Session layer configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Messages buffered per client before it is evicted as a slow consumer
    pub outbound_capacity: usize,
    /// Presence entries not refreshed for this long are dropped
    pub presence_ttl: Duration,
    /// How often each room sweeps stale presence and orphaned items
    pub sweep_interval: Duration,
    /// Buffered items whose origin never arrived are dropped after this long
    pub orphan_max_age: Duration,
    /// Capacity of each room's event channel
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            presence_ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            orphan_max_age: Duration::from_secs(60),
            event_capacity: 64,
        }
    }
}

/// A position-based edit made by an in-process participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOp {
    Insert { index: usize, text: String },
    Delete { index: usize, len: usize },
    /// Replace the whole visible text.
    Replace { text: String },
}

/// What a joining client needs to catch up.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncResponse {
    /// Full snapshot, or the diff against the state vector the client sent.
    pub snapshot: Update,
    pub state_vector: StateVector,
    pub presence: Vec<PresenceEntry>,
}

impl SyncResponse {
    /// The `Snapshot` message answering a join.
    pub fn to_message(&self, room_id: &str) -> Result<SyncMessage, CollabError> {
        Ok(SyncMessage::snapshot(
            room_id,
            &SnapshotPayload {
                update: encode_update(&self.snapshot)?,
                state_vector: self.state_vector.clone(),
                presence: self.presence.clone(),
            },
        ))
    }
}

/// Room activity, for presentation layers running in-process.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// The document changed. `origin` is `None` for edits the room itself
    /// authored (see [`SessionManager::on_local_edit`]).
    Applied {
        origin: Option<ClientId>,
        update: Outbound,
        text: String,
    },
    PresenceChanged(Vec<PresenceEntry>),
    ClientJoined(ClientId),
    ClientLeft(ClientId),
}

struct Room {
    id: RoomId,
    doc: Document,
    clients: BroadcastGroup,
    presence: PresenceTracker,
    events: broadcast::Sender<RoomEvent>,
    closed: bool,
    sweeper: Option<JoinHandle<()>>,
}

impl Room {
    fn new(id: RoomId, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            id,
            doc: Document::new(),
            clients: BroadcastGroup::new(),
            presence: PresenceTracker::new(),
            events,
            closed: false,
            sweeper: None,
        }
    }

    fn emit(&self, event: RoomEvent) {
        // No subscribers is the common case.
        let _ = self.events.send(event);
    }

    fn encode(&self, msg: &SyncMessage) -> Result<Outbound, CollabError> {
        Ok(Arc::new(msg.encode()?))
    }

    /// Fan `bytes` out, then forget whoever had to be evicted.
    fn fan_out(&mut self, except: Option<ClientId>, bytes: Outbound) {
        let mut evicted = self.clients.broadcast_except(except, bytes);
        // Each round removes at least one client, so this terminates.
        while !evicted.is_empty() {
            let mut presence_changed = false;
            for id in &evicted {
                presence_changed |= self.presence.remove(id);
                self.emit(RoomEvent::ClientLeft(*id));
            }
            if !presence_changed {
                break;
            }
            match self.presence_set_bytes() {
                Ok(bytes) => evicted = self.clients.broadcast(bytes),
                Err(e) => {
                    log::error!("Failed to encode presence for room {}: {e}", self.id);
                    break;
                }
            }
            self.emit(RoomEvent::PresenceChanged(self.presence.entries()));
        }
    }

    fn presence_set_bytes(&self) -> Result<Outbound, CollabError> {
        self.encode(&SyncMessage::presence_set(&self.id, &self.presence.entries()))
    }

    fn broadcast_presence(&mut self) -> Result<(), CollabError> {
        let bytes = self.presence_set_bytes()?;
        self.emit(RoomEvent::PresenceChanged(self.presence.entries()));
        self.fan_out(None, bytes);
        Ok(())
    }

    fn sweep_presence(&mut self, now: Instant, ttl: Duration) -> Result<Vec<ClientId>, CollabError> {
        let dropped = self.presence.sweep_stale(now, ttl);
        if !dropped.is_empty() {
            log::debug!("Room {}: {} presence entries expired", self.id, dropped.len());
            self.broadcast_presence()?;
        }
        Ok(dropped)
    }

    fn close(&mut self) {
        self.closed = true;
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

/// Owns every room on the server.
pub struct SessionManager {
    config: SessionConfig,
    rooms: RwLock<HashMap<RoomId, Arc<Mutex<Room>>>>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            rooms: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SessionConfig::default())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Register `handle` in `room_id` and return the full document.
    pub async fn join_room(
        &self,
        room_id: &str,
        handle: ClientHandle,
    ) -> Result<SyncResponse, CollabError> {
        self.join_room_with_state(room_id, handle, &StateVector::new()).await
    }

    /// Register `handle` in `room_id`, creating the room if needed.
    ///
    /// A non-empty `peer_state` gets only what the peer is missing.
    pub async fn join_room_with_state(
        &self,
        room_id: &str,
        handle: ClientHandle,
        peer_state: &StateVector,
    ) -> Result<SyncResponse, CollabError> {
        loop {
            let room_arc = self.get_or_create(room_id).await;
            let mut room = room_arc.lock().await;
            if room.closed {
                drop(room);
                self.discard(room_id, &room_arc).await;
                continue;
            }

            let client_id = handle.client_id;
            if room.clients.add_client(handle).is_some() {
                log::debug!("Client {client_id} rejoined room {room_id}");
            }

            let snapshot = if peer_state.is_empty() {
                room.doc.snapshot()
            } else {
                diff_since(&room.doc, peer_state)
            };
            let response = SyncResponse {
                snapshot,
                state_vector: room.doc.state_vector().clone(),
                presence: room.presence.entries(),
            };
            room.emit(RoomEvent::ClientJoined(client_id));

            log::info!(
                "Client {client_id} joined room {room_id} ({} clients, {} items)",
                room.clients.len(),
                room.doc.len()
            );
            return Ok(response);
        }
    }

    /// Deregister a client. Discards the room once nobody is left.
    pub async fn leave_room(&self, room_id: &str, client_id: &ClientId) -> Result<(), CollabError> {
        self.leave(room_id, client_id, None).await
    }

    /// Deregister one connection of a client.
    ///
    /// A no-op when the client has since rejoined over a newer connection:
    /// its handle, presence and the room itself stay in place.
    pub async fn leave_connection(
        &self,
        room_id: &str,
        client_id: &ClientId,
        connection: ConnectionId,
    ) -> Result<(), CollabError> {
        self.leave(room_id, client_id, Some(connection)).await
    }

    async fn leave(
        &self,
        room_id: &str,
        client_id: &ClientId,
        connection: Option<ConnectionId>,
    ) -> Result<(), CollabError> {
        let room_arc = self.room(room_id).await?;
        let mut room = room_arc.lock().await;

        let was_member = match connection {
            None => room.clients.remove_client(client_id).is_some(),
            Some(connection) => {
                if room.clients.connection_of(client_id).is_some_and(|c| c != connection) {
                    log::debug!(
                        "Client {client_id} rejoined room {room_id}; ignoring leave of connection {connection}"
                    );
                    return Ok(());
                }
                room.clients.remove_connection(client_id, connection).is_some()
            }
        };
        if room.presence.remove(client_id) {
            room.broadcast_presence()?;
        }
        if was_member {
            room.emit(RoomEvent::ClientLeft(*client_id));
            log::info!("Client {client_id} left room {room_id}");
        }

        if room.clients.is_empty() && !room.closed {
            room.close();
            drop(room);
            self.discard(room_id, &room_arc).await;
            log::info!("Room {room_id} removed (empty)");
        }
        Ok(())
    }

    /// Apply an edit authored by the room's own replica and relay it.
    ///
    /// Returns the encoded update frame (empty edits still yield a frame).
    pub async fn on_local_edit(
        &self,
        room_id: &str,
        client_id: &ClientId,
        op: EditOp,
    ) -> Result<Vec<u8>, CollabError> {
        let room_arc = self.room(room_id).await?;
        let mut room = room_arc.lock().await;

        let update = match op {
            EditOp::Insert { index, text } => room.doc.insert_at(index, &text),
            EditOp::Delete { index, len } => room.doc.delete_range(index, len),
            EditOp::Replace { text } => room.doc.replace_all(&text),
        };
        let frame = encode_update(&update)?;
        if update.is_empty() {
            return Ok(frame);
        }

        let bytes = room.encode(&SyncMessage::update(*client_id, room_id, frame.clone()))?;
        room.fan_out(Some(*client_id), bytes.clone());
        let text = room.doc.to_visible_text();
        room.emit(RoomEvent::Applied {
            origin: None,
            update: bytes,
            text,
        });

        log::debug!("Room {room_id}: local edit of {} items", update.items.len());
        Ok(frame)
    }

    /// Merge an update received from `sender` and relay its bytes unchanged.
    ///
    /// A malformed frame leaves the room untouched.
    pub async fn on_remote_update(
        &self,
        room_id: &str,
        sender: &ClientId,
        frame: &[u8],
    ) -> Result<MergeOutcome, CollabError> {
        let update = decode_update(frame).inspect_err(|e| {
            log::warn!("Rejected update from {sender} in room {room_id}: {e}");
        })?;

        let room_arc = self.room(room_id).await?;
        let mut room = room_arc.lock().await;
        let outcome = room.doc.merge_update(&update);

        if outcome.changed() || outcome.buffered > 0 {
            let bytes = room.encode(&SyncMessage::update(*sender, room_id, frame.to_vec()))?;
            room.fan_out(Some(*sender), bytes.clone());
            if outcome.changed() {
                let text = room.doc.to_visible_text();
                room.emit(RoomEvent::Applied {
                    origin: Some(*sender),
                    update: bytes,
                    text,
                });
            }
        }

        log::trace!(
            "Room {room_id}: merged update from {sender} ({} integrated, {} buffered, {} deleted)",
            outcome.integrated,
            outcome.buffered,
            outcome.deleted
        );
        Ok(outcome)
    }

    /// Store a client's presence and broadcast the room's presence set.
    pub async fn set_presence(
        &self,
        room_id: &str,
        client_id: &ClientId,
        payload: Vec<u8>,
    ) -> Result<(), CollabError> {
        let room_arc = self.room(room_id).await?;
        let mut room = room_arc.lock().await;
        if room.presence.set(*client_id, payload, Instant::now()) {
            room.broadcast_presence()?;
        }
        Ok(())
    }

    /// Mark a client's presence as still alive.
    pub async fn touch_presence(&self, room_id: &str, client_id: &ClientId) -> Result<(), CollabError> {
        let room_arc = self.room(room_id).await?;
        room_arc.lock().await.presence.touch(client_id, Instant::now());
        Ok(())
    }

    pub async fn remove_presence(&self, room_id: &str, client_id: &ClientId) -> Result<bool, CollabError> {
        let room_arc = self.room(room_id).await?;
        let mut room = room_arc.lock().await;
        let removed = room.presence.remove(client_id);
        if removed {
            room.broadcast_presence()?;
        }
        Ok(removed)
    }

    /// Drop presence entries older than `ttl` as of `now`.
    pub async fn sweep_stale(
        &self,
        room_id: &str,
        now: Instant,
        ttl: Duration,
    ) -> Result<Vec<ClientId>, CollabError> {
        let room_arc = self.room(room_id).await?;
        let mut room = room_arc.lock().await;
        room.sweep_presence(now, ttl)
    }

    /// Subscribe to a room's events.
    pub async fn subscribe(&self, room_id: &str) -> Result<broadcast::Receiver<RoomEvent>, CollabError> {
        let room_arc = self.room(room_id).await?;
        let room = room_arc.lock().await;
        Ok(room.events.subscribe())
    }

    /// Visible text of a room.
    pub async fn text(&self, room_id: &str) -> Result<String, CollabError> {
        let room_arc = self.room(room_id).await?;
        let room = room_arc.lock().await;
        Ok(room.doc.to_visible_text())
    }

    pub async fn presence(&self, room_id: &str) -> Result<Vec<PresenceEntry>, CollabError> {
        let room_arc = self.room(room_id).await?;
        let room = room_arc.lock().await;
        Ok(room.presence.entries())
    }

    pub async fn broadcast_stats(&self, room_id: &str) -> Result<BroadcastStats, CollabError> {
        let room_arc = self.room(room_id).await?;
        let room = room_arc.lock().await;
        Ok(room.clients.stats())
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Connected clients in a room (0 for unknown rooms).
    pub async fn client_count(&self, room_id: &str) -> usize {
        match self.room(room_id).await {
            Ok(room) => room.lock().await.clients.len(),
            Err(_) => 0,
        }
    }

    async fn room(&self, room_id: &str) -> Result<Arc<Mutex<Room>>, CollabError> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .cloned()
            .ok_or_else(|| CollabError::UnknownRoom(room_id.to_string()))
    }

    async fn get_or_create(&self, room_id: &str) -> Arc<Mutex<Room>> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }

        let mut room = Room::new(room_id.to_string(), self.config.event_capacity);
        let room_arc = Arc::new_cyclic(|weak: &Weak<Mutex<Room>>| {
            room.sweeper = Some(spawn_sweeper(weak.clone(), self.config.clone()));
            Mutex::new(room)
        });
        rooms.insert(room_id.to_string(), room_arc.clone());
        log::info!("Room {room_id} created");
        room_arc
    }

    /// Remove `room_arc` from the map if it is still the registered room.
    async fn discard(&self, room_id: &str, room_arc: &Arc<Mutex<Room>>) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(room_id).is_some_and(|current| Arc::ptr_eq(current, room_arc)) {
            rooms.remove(room_id);
        }
    }
}

/// Periodic presence expiry and orphan cleanup for one room.
///
/// Holds only a weak reference; exits when the room is closed or dropped.
fn spawn_sweeper(room: Weak<Mutex<Room>>, config: SessionConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(room_arc) = room.upgrade() else { break };
            let mut room = room_arc.lock().await;
            if room.closed {
                break;
            }

            let now = Instant::now();
            if let Err(e) = room.sweep_presence(now, config.presence_ttl) {
                log::error!("Presence sweep failed in room {}: {e}", room.id);
            }
            for orphan in room.doc.drop_orphans(now, config.orphan_max_age) {
                log::warn!(
                    "Room {}: dropped item {} after {:?}, origin {} never arrived",
                    room.id,
                    orphan.id,
                    orphan.waited,
                    orphan.missing_origin
                );
            }
            let stale = room.doc.drop_stale_deletes(now, config.orphan_max_age);
            if stale > 0 {
                log::warn!("Room {}: dropped {stale} deletes for items that never arrived", room.id);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;
    use uuid::Uuid;

    fn client(capacity: usize) -> (ClientHandle, tokio::sync::mpsc::Receiver<Outbound>) {
        ClientHandle::new(Uuid::new_v4(), capacity)
    }

    #[tokio::test]
    async fn test_join_creates_room_with_empty_snapshot() {
        let sessions = SessionManager::with_defaults();
        let (handle, _rx) = client(8);

        let response = sessions.join_room("fresh", handle).await.unwrap();
        assert!(response.snapshot.is_empty());
        assert!(response.state_vector.is_empty());
        assert!(response.presence.is_empty());
        assert_eq!(sessions.room_count().await, 1);
        assert_eq!(sessions.client_count("fresh").await, 1);
    }

    #[tokio::test]
    async fn test_local_edit_reaches_other_clients_not_author() {
        let sessions = SessionManager::with_defaults();
        let (alice, mut alice_rx) = client(8);
        let (bob, mut bob_rx) = client(8);
        let alice_id = alice.client_id;
        sessions.join_room("r", alice).await.unwrap();
        sessions.join_room("r", bob).await.unwrap();

        let frame = sessions
            .on_local_edit("r", &alice_id, EditOp::Insert { index: 0, text: "hi".into() })
            .await
            .unwrap();

        let relayed = SyncMessage::decode(&bob_rx.recv().await.unwrap()).unwrap();
        assert_eq!(relayed.msg_type, MessageType::Update);
        assert_eq!(relayed.payload, frame);
        assert!(alice_rx.try_recv().is_err());
        assert_eq!(sessions.text("r").await.unwrap(), "hi");
    }

    #[tokio::test]
    async fn test_replace_and_delete_ops() {
        let sessions = SessionManager::with_defaults();
        let (handle, _rx) = client(8);
        let id = handle.client_id;
        sessions.join_room("r", handle).await.unwrap();

        sessions
            .on_local_edit("r", &id, EditOp::Replace { text: "print(1)".into() })
            .await
            .unwrap();
        sessions
            .on_local_edit("r", &id, EditOp::Delete { index: 0, len: 6 })
            .await
            .unwrap();
        assert_eq!(sessions.text("r").await.unwrap(), "1)");
    }

    #[tokio::test]
    async fn test_malformed_update_leaves_room_untouched() {
        let sessions = SessionManager::with_defaults();
        let (handle, _rx) = client(8);
        let id = handle.client_id;
        sessions.join_room("r", handle).await.unwrap();
        sessions
            .on_local_edit("r", &id, EditOp::Insert { index: 0, text: "ok".into() })
            .await
            .unwrap();

        let result = sessions.on_remote_update("r", &id, &[1, 200, 0, 0, 0, 1]).await;
        assert!(matches!(result, Err(CollabError::MalformedUpdate(_))));
        assert_eq!(sessions.text("r").await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_unknown_room_errors() {
        let sessions = SessionManager::with_defaults();
        let id = Uuid::new_v4();
        assert!(matches!(
            sessions.text("nope").await,
            Err(CollabError::UnknownRoom(_))
        ));
        assert!(sessions.leave_room("nope", &id).await.is_err());
        assert_eq!(sessions.client_count("nope").await, 0);
    }

    #[tokio::test]
    async fn test_room_discarded_when_last_client_leaves() {
        let sessions = SessionManager::with_defaults();
        let (a, _a_rx) = client(8);
        let (b, _b_rx) = client(8);
        let (a_id, b_id) = (a.client_id, b.client_id);
        sessions.join_room("r", a).await.unwrap();
        sessions.join_room("r", b).await.unwrap();

        sessions.leave_room("r", &a_id).await.unwrap();
        assert_eq!(sessions.room_count().await, 1);
        sessions.leave_room("r", &b_id).await.unwrap();
        assert_eq!(sessions.room_count().await, 0);

        // Rejoining starts from an empty document.
        let (c, _c_rx) = client(8);
        let response = sessions.join_room("r", c).await.unwrap();
        assert!(response.snapshot.is_empty());
    }

    #[tokio::test]
    async fn test_leave_of_superseded_connection_is_ignored() {
        let sessions = SessionManager::with_defaults();
        let id = Uuid::new_v4();
        let (old, _old_rx) = ClientHandle::new(id, 8);
        let old_connection = old.connection;
        sessions.join_room("r", old).await.unwrap();
        sessions.set_presence("r", &id, vec![3]).await.unwrap();

        // Same client reconnects before its old connection is cleaned up.
        let (new, mut new_rx) = ClientHandle::new(id, 8);
        let new_connection = new.connection;
        sessions.join_room("r", new).await.unwrap();

        sessions.leave_connection("r", &id, old_connection).await.unwrap();
        assert_eq!(sessions.room_count().await, 1);
        assert_eq!(sessions.client_count("r").await, 1);
        assert_eq!(sessions.presence("r").await.unwrap().len(), 1);

        sessions
            .on_local_edit("r", &Uuid::new_v4(), EditOp::Insert { index: 0, text: "ok".into() })
            .await
            .unwrap();
        let relayed = SyncMessage::decode(&new_rx.recv().await.unwrap()).unwrap();
        assert_eq!(relayed.msg_type, MessageType::Update);

        sessions.leave_connection("r", &id, new_connection).await.unwrap();
        assert_eq!(sessions.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_join_with_state_returns_diff() {
        let sessions = SessionManager::with_defaults();
        let (author, _rx) = client(8);
        let author_id = author.client_id;
        sessions.join_room("r", author).await.unwrap();
        sessions
            .on_local_edit("r", &author_id, EditOp::Insert { index: 0, text: "abc".into() })
            .await
            .unwrap();

        let (first, _first_rx) = client(8);
        let full = sessions.join_room("r", first).await.unwrap();
        let mut replica = Document::new();
        replica.merge_update(&full.snapshot);

        sessions
            .on_local_edit("r", &author_id, EditOp::Insert { index: 3, text: "d".into() })
            .await
            .unwrap();

        let (second, _second_rx) = client(8);
        let diff = sessions
            .join_room_with_state("r", second, replica.state_vector())
            .await
            .unwrap();
        assert_eq!(diff.snapshot.items.len(), 1);
        replica.merge_update(&diff.snapshot);
        assert_eq!(replica.to_visible_text(), "abcd");
    }

    #[tokio::test]
    async fn test_presence_set_broadcast_to_all() {
        let sessions = SessionManager::with_defaults();
        let (a, mut a_rx) = client(8);
        let (b, mut b_rx) = client(8);
        let a_id = a.client_id;
        sessions.join_room("r", a).await.unwrap();
        sessions.join_room("r", b).await.unwrap();

        sessions.set_presence("r", &a_id, vec![42]).await.unwrap();

        for rx in [&mut a_rx, &mut b_rx] {
            let msg = SyncMessage::decode(&rx.recv().await.unwrap()).unwrap();
            let entries = msg.presence_entries().unwrap();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].client_id, a_id);
            assert_eq!(entries[0].payload, vec![42]);
        }

        // Same payload again: nothing to announce.
        sessions.set_presence("r", &a_id, vec![42]).await.unwrap();
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_presence_sweep_expires_entries() {
        let sessions = SessionManager::with_defaults();
        let (a, _a_rx) = client(8);
        let a_id = a.client_id;
        sessions.join_room("r", a).await.unwrap();
        sessions.set_presence("r", &a_id, vec![1]).await.unwrap();

        let later = Instant::now() + Duration::from_secs(31);
        let dropped = sessions
            .sweep_stale("r", later, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(dropped, vec![a_id]);
        assert!(sessions.presence("r").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_sees_applied_events() {
        let sessions = SessionManager::with_defaults();
        let (a, _a_rx) = client(8);
        let a_id = a.client_id;
        sessions.join_room("r", a).await.unwrap();
        let mut events = sessions.subscribe("r").await.unwrap();

        sessions
            .on_local_edit("r", &a_id, EditOp::Insert { index: 0, text: "x".into() })
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            RoomEvent::Applied { origin, text, .. } => {
                assert_eq!(origin, None);
                assert_eq!(text, "x");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sync_response_message() {
        let sessions = SessionManager::with_defaults();
        let (a, _rx) = client(8);
        let a_id = a.client_id;
        sessions.join_room("r", a).await.unwrap();
        sessions
            .on_local_edit("r", &a_id, EditOp::Insert { index: 0, text: "hey".into() })
            .await
            .unwrap();

        let (b, _b_rx) = client(8);
        let response = sessions.join_room("r", b).await.unwrap();
        let payload = response.to_message("r").unwrap().snapshot_payload().unwrap();

        let mut replica = Document::new();
        replica.merge_update(&decode_update(&payload.update).unwrap());
        assert_eq!(replica.to_visible_text(), "hey");
        assert_eq!(&payload.state_vector, replica.state_vector());
    }
}
