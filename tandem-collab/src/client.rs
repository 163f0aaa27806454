//! WebSocket sync client for one room.
//!
//! Provides:
//! - Connection lifecycle with automatic reconnect and backoff
//! - Local-first editing on a local replica
//! - Full resync on every (re)connect, then push of local-only edits
//! - Throttled presence and heartbeat pings
//!
//! ```text
//!  Disconnected ──► Connecting ──► Syncing ──► Live
//!       ▲               │             │          │
//!       └───────────────┴─────────────┴──────────┘  transport failure
//! ```
//!
//! Edits made while not `Live` stay in the local replica; the diff pushed
//! after the next snapshot carries them to the server.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use futures_util::{SinkExt, StreamExt};
use tandem_core::{decode_update, diff_since, encode_update, Document, ReplicaId, StateVector, Update};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::CollabError;
use crate::presence::{PresencePayload, PresenceThrottle};
use crate::protocol::{
    ClientId, JoinRequest, MessageType, PresenceEntry, ProtocolError, SnapshotPayload, SyncMessage,
};
use crate::session::EditOp;

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    pub initial: Duration,
    /// Upper bound for any delay
    pub max: Duration,
    /// Growth factor per failed attempt
    pub multiplier: f64,
    /// Give up after this many consecutive failures (`None` = never)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let secs = self.initial.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Whether another attempt is allowed after `failures` consecutive ones.
    pub fn allows(&self, failures: u32) -> bool {
        self.max_attempts.is_none_or(|max| failures < max)
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL, e.g. `ws://127.0.0.1:9090`; the room id is appended as path
    pub server_url: String,
    pub room_id: String,
    pub client_id: ClientId,
    /// Ping period; must be shorter than the server's idle timeout
    pub heartbeat_interval: Duration,
    /// Minimum spacing of outgoing presence updates
    pub presence_interval: Duration,
    pub reconnect: ReconnectPolicy,
    /// Capacity of the event channel
    pub event_capacity: usize,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            room_id: room_id.into(),
            client_id: Uuid::new_v4(),
            heartbeat_interval: Duration::from_secs(10),
            presence_interval: Duration::from_millis(50),
            reconnect: ReconnectPolicy::default(),
            event_capacity: 256,
        }
    }

    /// `<server_url>/<room_id>`
    pub fn room_url(&self) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), self.room_id)
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Syncing,
    Live,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StateChanged(ClientState),
    /// Initial (or re-)sync finished; carries the merged text
    Synced { text: String },
    /// A remote update changed the document
    RemoteChange { text: String },
    PresenceChanged(Vec<PresenceEntry>),
    Error(String),
}

/// How one connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionEnd {
    Shutdown,
    Lost { was_live: bool },
}

/// State shared between the client handle and its connection task.
struct Shared {
    config: ClientConfig,
    doc: Mutex<Document>,
    state: RwLock<ClientState>,
    generation: AtomicU64,
    /// Present only while `Live`; written under the `doc` lock.
    outgoing: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    presence: Mutex<PresenceState>,
    event_tx: mpsc::Sender<SyncEvent>,
}

struct PresenceState {
    throttle: PresenceThrottle,
    /// Latest payload, re-announced on every join.
    last: Option<Vec<u8>>,
}

impl Shared {
    fn emit(&self, event: SyncEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            log::debug!("Dropping sync event: {e}");
        }
    }

    async fn set_state(&self, next: ClientState) {
        let mut state = self.state.write().await;
        if *state != next {
            *state = next;
            self.emit(SyncEvent::StateChanged(next));
        }
    }

    fn encode(&self, msg: &SyncMessage) -> Result<Vec<u8>, ProtocolError> {
        msg.encode()
    }

    /// Merge a snapshot from connection attempt `generation`.
    ///
    /// Returns the diff of local-only edits to push, or `None` when the
    /// attempt is no longer current and the snapshot was ignored.
    async fn apply_snapshot(
        &self,
        generation: u64,
        payload: &SnapshotPayload,
        out_tx: &mpsc::Sender<Vec<u8>>,
    ) -> Result<Option<Update>, CollabError> {
        if generation != self.generation.load(Ordering::SeqCst) {
            log::debug!("Ignoring snapshot from stale attempt {generation}");
            return Ok(None);
        }
        let snapshot = decode_update(&payload.update)?;

        let mut doc = self.doc.lock().await;
        doc.merge_update(&snapshot);
        let local_only = diff_since(&doc, &payload.state_vector);
        *self.outgoing.lock().await = Some(out_tx.clone());
        let text = doc.to_visible_text();
        drop(doc);

        self.set_state(ClientState::Live).await;
        self.emit(SyncEvent::Synced { text });
        self.emit(SyncEvent::PresenceChanged(payload.presence.clone()));
        Ok(Some(local_only))
    }

    async fn apply_remote(&self, frame: &[u8]) -> Result<(), CollabError> {
        let update = decode_update(frame)?;
        let mut doc = self.doc.lock().await;
        let outcome = doc.merge_update(&update);
        if outcome.changed() {
            let text = doc.to_visible_text();
            drop(doc);
            self.emit(SyncEvent::RemoteChange { text });
        }
        Ok(())
    }

    async fn go_offline(&self) {
        let _doc = self.doc.lock().await;
        *self.outgoing.lock().await = None;
    }

    async fn send_if_live(&self, msg: &SyncMessage) -> Result<(), CollabError> {
        if let Some(tx) = self.outgoing.lock().await.as_ref() {
            let bytes = self.encode(msg)?;
            if tx.send(bytes).await.is_err() {
                log::debug!("Connection closed before message could be queued");
            }
        }
        Ok(())
    }

    async fn supervise(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let policy = self.config.reconnect.clone();
        let mut failures = 0u32;

        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            self.set_state(ClientState::Connecting).await;

            match self.run_connection(generation, &mut shutdown).await {
                Ok(ConnectionEnd::Shutdown) => break,
                Ok(ConnectionEnd::Lost { was_live }) => {
                    log::info!("Connection to {} lost", self.config.room_url());
                    if was_live {
                        failures = 0;
                    }
                }
                Err(e) => {
                    log::warn!("Connection attempt {generation} failed: {e}");
                    self.emit(SyncEvent::Error(e.to_string()));
                }
            }

            self.go_offline().await;
            self.set_state(ClientState::Disconnected).await;

            if !policy.allows(failures) {
                self.emit(SyncEvent::Error(format!("giving up after {failures} attempts")));
                break;
            }
            let delay = policy.delay(failures);
            failures = failures.saturating_add(1);
            log::debug!("Reconnecting in {delay:?}");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.go_offline().await;
        self.set_state(ClientState::Disconnected).await;
    }

    async fn run_connection(
        &self,
        generation: u64,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ConnectionEnd, CollabError> {
        let url = self.config.room_url();
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| CollabError::TransportLost(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let lost = |e: tokio_tungstenite::tungstenite::Error| CollabError::TransportLost(e.to_string());

        self.set_state(ClientState::Syncing).await;

        // Every join is a full resync: the server's room may have been
        // discarded and recreated since we last saw it.
        let request = JoinRequest {
            state_vector: StateVector::new(),
            presence: self.presence.lock().await.last.clone(),
        };
        let client_id = self.config.client_id;
        let room_id = self.config.room_id.as_str();
        let join = self.encode(&SyncMessage::join(client_id, room_id, &request))?;
        ws_writer.send(Message::Binary(join.into())).await.map_err(lost)?;

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        let mut live = false;

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;
        let mut presence_tick = tokio::time::interval(self.config.presence_interval);
        presence_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                msg = ws_reader.next() => {
                    let bytes: Vec<u8> = match msg {
                        Some(Ok(Message::Binary(data))) => data.into(),
                        Some(Ok(Message::Close(_))) | None => {
                            return Ok(ConnectionEnd::Lost { was_live: live });
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_writer.send(Message::Pong(data)).await.map_err(lost)?;
                            continue;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(lost(e)),
                    };
                    let sync_msg = match SyncMessage::decode(&bytes) {
                        Ok(m) => m,
                        Err(e) => {
                            log::warn!("Undecodable message from server: {e}");
                            continue;
                        }
                    };

                    match sync_msg.msg_type {
                        MessageType::Snapshot => {
                            let payload = sync_msg.snapshot_payload()?;
                            if let Some(local_only) = self.apply_snapshot(generation, &payload, &out_tx).await? {
                                live = true;
                                if !local_only.is_empty() {
                                    log::info!("Pushing {} local items after resync", local_only.items.len());
                                    let push = SyncMessage::update(client_id, room_id, encode_update(&local_only)?);
                                    ws_writer.send(Message::Binary(self.encode(&push)?.into())).await.map_err(lost)?;
                                }
                            }
                        }
                        MessageType::Update => {
                            if let Err(e) = self.apply_remote(&sync_msg.payload).await {
                                // Our replica can no longer trust this stream; resync.
                                self.emit(SyncEvent::Error(e.to_string()));
                                return Err(e);
                            }
                        }
                        MessageType::PresenceSet => {
                            self.emit(SyncEvent::PresenceChanged(sync_msg.presence_entries()?));
                        }
                        MessageType::Error => {
                            let reason = sync_msg.error_reason()?;
                            log::warn!("Server rejected client {client_id}: {reason}");
                            self.emit(SyncEvent::Error(reason.clone()));
                            return Err(CollabError::TransportLost(reason));
                        }
                        MessageType::Pong => {
                            log::trace!("Pong from server");
                        }
                        other => {
                            log::debug!("Unhandled message type: {other:?}");
                        }
                    }
                }

                Some(data) = out_rx.recv() => {
                    ws_writer.send(Message::Binary(data.into())).await.map_err(lost)?;
                }

                _ = heartbeat.tick() => {
                    let ping = self.encode(&SyncMessage::ping(client_id))?;
                    ws_writer.send(Message::Binary(ping.into())).await.map_err(lost)?;
                }

                _ = presence_tick.tick(), if live => {
                    let flushed = self.presence.lock().await.throttle.flush(Instant::now());
                    if let Some(payload) = flushed {
                        let msg = SyncMessage::presence(client_id, room_id, payload);
                        ws_writer.send(Message::Binary(self.encode(&msg)?.into())).await.map_err(lost)?;
                    }
                }

                _ = shutdown.changed() => {
                    let leave = self.encode(&SyncMessage::leave(client_id, room_id))?;
                    let _ = ws_writer.send(Message::Binary(leave.into())).await;
                    let _ = ws_writer.close().await;
                    return Ok(ConnectionEnd::Shutdown);
                }
            }
        }
    }
}

/// The sync client.
///
/// Owns the local replica of one room and keeps it converged with the
/// server's copy while connected.
pub struct SyncClient {
    shared: Arc<Shared>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    shutdown: watch::Sender<bool>,
    supervisor: Option<JoinHandle<()>>,
}

impl SyncClient {
    /// Create a new, not yet connected client.
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        let replica = ReplicaId::from_uuid(config.client_id);
        let throttle = PresenceThrottle::new(config.presence_interval);
        Self {
            shared: Arc::new(Shared {
                config,
                doc: Mutex::new(Document::with_replica(replica)),
                state: RwLock::new(ClientState::Disconnected),
                generation: AtomicU64::new(0),
                outgoing: Mutex::new(None),
                presence: Mutex::new(PresenceState { throttle, last: None }),
                event_tx,
            }),
            event_rx: Some(event_rx),
            shutdown,
            supervisor: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Start connecting in the background. Reconnects until [`close`].
    ///
    /// [`close`]: SyncClient::close
    pub fn connect(&mut self) {
        if self.supervisor.is_some() {
            return;
        }
        let shutdown = self.shutdown.subscribe();
        let shared = self.shared.clone();
        self.supervisor = Some(tokio::spawn(shared.supervise(shutdown)));
    }

    /// Apply an edit locally, then send it if connected.
    pub async fn edit(&self, op: EditOp) -> Result<(), CollabError> {
        let (update, outgoing) = {
            let mut doc = self.shared.doc.lock().await;
            let update = match op {
                EditOp::Insert { index, text } => doc.insert_at(index, &text),
                EditOp::Delete { index, len } => doc.delete_range(index, len),
                EditOp::Replace { text } => doc.replace_all(&text),
            };
            // Read under the doc lock: a concurrent resync either includes
            // this edit in its diff or has already gone live.
            let outgoing = self.shared.outgoing.lock().await.clone();
            (update, outgoing)
        };
        let Some(tx) = outgoing else { return Ok(()) };
        if update.is_empty() {
            return Ok(());
        }

        let msg = SyncMessage::update(
            self.shared.config.client_id,
            &self.shared.config.room_id,
            encode_update(&update)?,
        );
        if tx.send(msg.encode()?).await.is_err() {
            log::debug!("Connection closed; edit will be pushed after resync");
        }
        Ok(())
    }

    pub async fn insert(&self, index: usize, text: &str) -> Result<(), CollabError> {
        self.edit(EditOp::Insert { index, text: text.to_string() }).await
    }

    pub async fn delete(&self, index: usize, len: usize) -> Result<(), CollabError> {
        self.edit(EditOp::Delete { index, len }).await
    }

    pub async fn replace_all(&self, text: &str) -> Result<(), CollabError> {
        self.edit(EditOp::Replace { text: text.to_string() }).await
    }

    /// Publish presence, throttled to one update per presence interval.
    pub async fn set_presence(&self, payload: &PresencePayload) -> Result<(), CollabError> {
        let bytes = payload.encode();
        let ready = {
            let mut presence = self.shared.presence.lock().await;
            presence.last = Some(bytes.clone());
            presence.throttle.offer(bytes, Instant::now())
        };
        if let Some(bytes) = ready {
            let msg = SyncMessage::presence(
                self.shared.config.client_id,
                &self.shared.config.room_id,
                bytes,
            );
            self.shared.send_if_live(&msg).await?;
        }
        Ok(())
    }

    /// Visible text of the local replica.
    pub async fn text(&self) -> String {
        self.shared.doc.lock().await.to_visible_text()
    }

    pub async fn state(&self) -> ClientState {
        *self.shared.state.read().await
    }

    /// Number of connection attempts so far.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    pub fn client_id(&self) -> ClientId {
        self.shared.config.client_id
    }

    pub fn room_id(&self) -> &str {
        &self.shared.config.room_id
    }

    pub fn server_url(&self) -> &str {
        &self.shared.config.server_url
    }

    /// Send `Leave` if connected and stop reconnecting.
    pub async fn close(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(supervisor) = self.supervisor.take() {
            if let Err(e) = supervisor.await {
                log::error!("Sync supervisor task failed: {e}");
            }
        }
        self.shared.go_offline().await;
        self.shared.set_state(ClientState::Disconnected).await;
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
    }
}
