//! # tandem-collab — Real-time collaboration layer for Tandem
//!
//! Keeps replicas of a shared text buffer converged over WebSockets.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌────────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer     │
//! │ (per user)  │    SyncMessage     │ (central)      │
//! └──────┬──────┘                    └───────┬────────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                    ┌────────────────┐
//! │ Document    │                    │ SessionManager │
//! │ (local)     │                    │  Room → Document (authority)
//! └─────────────┘                    │       → BroadcastGroup
//!                                    │       → PresenceTracker
//!                                    └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary envelope (bincode-encoded `SyncMessage`)
//! - [`broadcast`] — per-client bounded queues, slow-consumer eviction
//! - [`session`] — rooms, joins, edits, relays
//! - [`presence`] — ephemeral presence with TTL, client-side throttle
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client with reconnect and resync
//! - [`execution`] — running the shared buffer as code

pub mod protocol;
pub mod broadcast;
pub mod session;
pub mod presence;
pub mod server;
pub mod client;
pub mod execution;
pub mod error;

// Re-exports for convenience
pub use protocol::{
    ClientId, JoinRequest, MessageType, PresenceEntry, ProtocolError, RoomId, SnapshotPayload,
    SyncMessage,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, ClientHandle, ConnectionId, Outbound};
pub use session::{EditOp, RoomEvent, SessionConfig, SessionManager, SyncResponse};
pub use presence::{PresencePayload, PresenceRecord, PresenceThrottle, PresenceTracker};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ClientConfig, ClientState, ReconnectPolicy, SyncClient, SyncEvent};
pub use execution::{
    execute, CodeRunner, ExecutionError, Language, OutputKind, OutputLine, ProcessRunner,
};
pub use error::CollabError;
