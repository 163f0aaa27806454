//! Binary envelope protocol between clients and the sync server.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────────┬──────────┐
//! │ msg_type │ client_id │ room_id      │ payload  │
//! │ 1 byte   │ 16 bytes  │ len + UTF-8  │ variable │
//! └──────────┴───────────┴──────────────┴──────────┘
//! ```
//!
//! `Update` payloads are codec frames from `tandem_core::codec`, relayed
//! byte-for-byte. `Presence` payloads are opaque to the server.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tandem_core::StateVector;
use thiserror::Error;
use uuid::Uuid;

/// Room key. Rooms are named by whatever string the first joiner used.
pub type RoomId = String;

/// Identity of one connected client.
pub type ClientId = Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client asks to join a room (carries its state vector)
    Join = 1,
    /// Server answers a join with the document and presence set
    Snapshot = 2,
    /// Document update (codec frame)
    Update = 3,
    /// Client presence payload
    Presence = 4,
    /// Full presence set of a room
    PresenceSet = 5,
    /// Client leaves the room
    Leave = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
    /// Server-side rejection, sent before closing
    Error = 9,
}

/// Payload of a `Join` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Empty on first join and on every reconnect (full resync).
    pub state_vector: StateVector,
    /// Initial presence payload, if the client has one.
    pub presence: Option<Vec<u8>>,
}

/// One entry of a room's presence set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub client_id: ClientId,
    pub payload: Vec<u8>,
}

/// Payload of a `Snapshot` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    /// Codec frame: full snapshot or diff.
    pub update: Vec<u8>,
    /// Server document state vector after the join.
    pub state_vector: StateVector,
    pub presence: Vec<PresenceEntry>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Sender (nil for server-originated messages)
    pub client_id: ClientId,
    pub room_id: RoomId,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

fn encode_payload<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).unwrap_or_default()
}

impl SyncMessage {
    fn new(msg_type: MessageType, client_id: ClientId, room_id: &str, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            client_id,
            room_id: room_id.to_string(),
            payload,
        }
    }

    /// Join request for `room_id`.
    pub fn join(client_id: ClientId, room_id: &str, request: &JoinRequest) -> Self {
        Self::new(MessageType::Join, client_id, room_id, encode_payload(request))
    }

    /// Server snapshot answering a join.
    pub fn snapshot(room_id: &str, snapshot: &SnapshotPayload) -> Self {
        Self::new(MessageType::Snapshot, Uuid::nil(), room_id, encode_payload(snapshot))
    }

    /// Document update carrying an encoded codec frame.
    pub fn update(client_id: ClientId, room_id: &str, frame: Vec<u8>) -> Self {
        Self::new(MessageType::Update, client_id, room_id, frame)
    }

    /// Opaque presence payload of one client.
    pub fn presence(client_id: ClientId, room_id: &str, payload: Vec<u8>) -> Self {
        Self::new(MessageType::Presence, client_id, room_id, payload)
    }

    /// Full presence set of a room.
    pub fn presence_set(room_id: &str, entries: &[PresenceEntry]) -> Self {
        Self::new(MessageType::PresenceSet, Uuid::nil(), room_id, encode_payload(&entries))
    }

    pub fn leave(client_id: ClientId, room_id: &str) -> Self {
        Self::new(MessageType::Leave, client_id, room_id, Vec::new())
    }

    pub fn ping(client_id: ClientId) -> Self {
        Self::new(MessageType::Ping, client_id, "", Vec::new())
    }

    pub fn pong(client_id: ClientId) -> Self {
        Self::new(MessageType::Pong, client_id, "", Vec::new())
    }

    /// Rejection notice; the server closes the connection after sending it.
    pub fn error(room_id: &str, reason: &str) -> Self {
        Self::new(MessageType::Error, Uuid::nil(), room_id, reason.as_bytes().to_vec())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    fn parse<T: DeserializeOwned>(&self, expected: MessageType) -> Result<T, ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (value, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(value)
    }

    /// Parse join payload.
    pub fn join_request(&self) -> Result<JoinRequest, ProtocolError> {
        self.parse(MessageType::Join)
    }

    /// Parse snapshot payload.
    pub fn snapshot_payload(&self) -> Result<SnapshotPayload, ProtocolError> {
        self.parse(MessageType::Snapshot)
    }

    /// Parse presence set payload.
    pub fn presence_entries(&self) -> Result<Vec<PresenceEntry>, ProtocolError> {
        self.parse(MessageType::PresenceSet)
    }

    /// Reason text of an error message.
    pub fn error_reason(&self) -> Result<String, ProtocolError> {
        if self.msg_type != MessageType::Error {
            return Err(ProtocolError::InvalidMessageType);
        }
        Ok(String::from_utf8_lossy(&self.payload).into_owned())
    }
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid message type")]
    InvalidMessageType,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}
