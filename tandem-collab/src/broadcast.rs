//! Fan-out of encoded messages to the clients of one room.
//!
//! Every client owns a bounded outbound queue. Fan-out never waits: a
//! `try_send` into a full queue evicts that client (its sender is dropped,
//! so its connection task sees the queue close and terminates) while the
//! rest of the room keeps receiving.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::CollabError;
use crate::protocol::ClientId;

/// Encoded message shared by every queue it is pushed into.
pub type Outbound = Arc<Vec<u8>>;

/// Process-unique token for one connection of a client.
///
/// A reconnecting client keeps its [`ClientId`]; the token tells its old and
/// new connections apart.
pub type ConnectionId = u64;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

fn next_connection() -> ConnectionId {
    NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed)
}

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub clients_evicted: u64,
    pub active_clients: usize,
}

/// Lock-free counters, readable without the room lock.
#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    clients_evicted: AtomicU64,
}

/// Sending half of one client's outbound queue.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub client_id: ClientId,
    pub connection: ConnectionId,
    outbound: mpsc::Sender<Outbound>,
}

impl ClientHandle {
    /// Create a handle and the receiving end of its bounded queue.
    pub fn new(client_id: ClientId, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        (Self::from_sender(client_id, outbound), rx)
    }

    /// Wrap an existing queue sender.
    pub fn from_sender(client_id: ClientId, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            client_id,
            connection: next_connection(),
            outbound,
        }
    }

    fn try_deliver(&self, bytes: &Outbound) -> Result<(), CollabError> {
        match self.outbound.try_send(bytes.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(CollabError::SlowConsumer(self.client_id)),
            Err(TrySendError::Closed(_)) => Err(CollabError::TransportLost(format!(
                "outbound queue of {} closed",
                self.client_id
            ))),
        }
    }
}

/// The connected clients of a single room.
///
/// Lives inside the room's mutex, so membership needs no lock of its own.
#[derive(Debug, Default)]
pub struct BroadcastGroup {
    clients: HashMap<ClientId, ClientHandle>,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client. A handle with the same id replaces the old one.
    pub fn add_client(&mut self, handle: ClientHandle) -> Option<ClientHandle> {
        self.clients.insert(handle.client_id, handle)
    }

    pub fn remove_client(&mut self, client_id: &ClientId) -> Option<ClientHandle> {
        self.clients.remove(client_id)
    }

    /// Remove the client only if its current handle belongs to `connection`.
    ///
    /// A handle registered by a newer connection of the same client stays.
    pub fn remove_connection(
        &mut self,
        client_id: &ClientId,
        connection: ConnectionId,
    ) -> Option<ClientHandle> {
        match self.clients.get(client_id) {
            Some(handle) if handle.connection == connection => self.clients.remove(client_id),
            _ => None,
        }
    }

    /// Connection token of the client's current handle.
    pub fn connection_of(&self, client_id: &ClientId) -> Option<ConnectionId> {
        self.clients.get(client_id).map(|h| h.connection)
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.clients.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    /// Queue `bytes` for one client.
    ///
    /// On failure the client is removed from the group, exactly as during
    /// fan-out.
    pub fn send_to(&mut self, client_id: &ClientId, bytes: Outbound) -> Result<(), CollabError> {
        let result = match self.clients.get(client_id) {
            Some(handle) => handle.try_deliver(&bytes),
            None => return Err(CollabError::UnknownRoom(format!("client {client_id} not in room"))),
        };
        match result {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.evict(client_id, &e);
                Err(e)
            }
        }
    }

    /// Queue `bytes` for every client except `except`.
    ///
    /// Returns the clients evicted because their queue was full or closed.
    pub fn broadcast_except(&mut self, except: Option<ClientId>, bytes: Outbound) -> Vec<ClientId> {
        let mut failed = Vec::new();
        for (id, handle) in &self.clients {
            if Some(*id) == except {
                continue;
            }
            match handle.try_deliver(&bytes) {
                Ok(()) => {
                    self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => failed.push((*id, e)),
            }
        }

        failed
            .into_iter()
            .map(|(id, e)| {
                self.evict(&id, &e);
                id
            })
            .collect()
    }

    /// Queue `bytes` for every client.
    pub fn broadcast(&mut self, bytes: Outbound) -> Vec<ClientId> {
        self.broadcast_except(None, bytes)
    }

    fn evict(&mut self, client_id: &ClientId, reason: &CollabError) {
        if self.clients.remove(client_id).is_some() {
            self.stats.clients_evicted.fetch_add(1, Ordering::Relaxed);
            log::warn!("Evicting client {client_id}: {reason}");
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            clients_evicted: self.stats.clients_evicted.load(Ordering::Relaxed),
            active_clients: self.clients.len(),
        }
    }
}
