use tandem_core::CoreError;
use thiserror::Error;

use crate::protocol::{ClientId, ProtocolError};

/// Collaboration-layer errors.
///
/// None of these are fatal to the process: each one ends at most a single
/// connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollabError {
    /// An update frame failed to decode or encode. A rejected incoming
    /// update leaves the room untouched.
    #[error(transparent)]
    MalformedUpdate(#[from] CoreError),
    /// A client's outbound queue was full and it was evicted.
    #[error("client {0} evicted: outbound queue full")]
    SlowConsumer(ClientId),
    #[error("transport lost: {0}")]
    TransportLost(String),
    #[error("unknown room: {0}")]
    UnknownRoom(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
