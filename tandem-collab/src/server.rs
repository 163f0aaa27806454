//! WebSocket sync server with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws://host/<room>
//!            ├── connection task ── SessionManager ── Room (Document)
//! Client B ──┘        ▲                                  │
//!                     │ bounded outbound queue           │ fan-out
//!                     └──────────────────────────────────┘
//! ```
//!
//! Every connection runs one task that multiplexes three sources with
//! `tokio::select!`: frames from the socket, messages queued for it by the
//! room, and an idle deadline refreshed by any inbound traffic.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{ClientHandle, ConnectionId, Outbound};
use crate::error::CollabError;
use crate::protocol::{ClientId, MessageType, RoomId, SyncMessage};
use crate::session::{SessionConfig, SessionManager};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum clients per room
    pub max_clients_per_room: usize,
    /// Connections silent for this long are dropped
    pub idle_timeout_secs: u64,
    /// Room behaviour (queue sizes, presence TTL, sweeps)
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_clients_per_room: 100,
            idle_timeout_secs: 30,
            session: SessionConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_updates: u64,
    pub active_rooms: usize,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    sessions: Arc<SessionManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let sessions = Arc::new(SessionManager::new(config.session.clone()));
        Self {
            config,
            sessions,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind to the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let sessions = self.sessions.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, sessions, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        sessions: Arc<SessionManager>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        // The room is addressed by the request path: ws://host/<room>.
        let mut path = String::new();
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                path = req.uri().path().to_string();
                Ok(resp)
            },
        )
        .await?;
        let path_room = path.trim_matches('/').to_string();

        log::info!("WebSocket connection established from {addr} (path /{path_room})");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut membership: Option<(RoomId, ClientId, ConnectionId)> = None;
        let result = Self::drive(
            ws_stream,
            addr,
            &path_room,
            &sessions,
            &stats,
            &config,
            &mut membership,
        )
        .await;

        // Cleanup: leave the room whatever ended the connection
        if let Some((room_id, client_id, connection)) = membership {
            if let Err(e) = sessions.leave_connection(&room_id, &client_id, connection).await {
                log::debug!("Leave of {client_id} from {room_id} after disconnect: {e}");
            }
        }

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = sessions.room_count().await;
        }

        result
    }

    async fn drive(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        addr: SocketAddr,
        path_room: &str,
        sessions: &SessionManager,
        stats: &RwLock<ServerStats>,
        config: &ServerConfig,
        membership: &mut Option<(RoomId, ClientId, ConnectionId)>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut outbound_rx: Option<mpsc::Receiver<Outbound>> = None;

        let idle = Duration::from_secs(config.idle_timeout_secs);
        let deadline = tokio::time::sleep(idle);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    deadline.as_mut().reset(Instant::now() + idle);
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            let sync_msg = match SyncMessage::decode(&bytes) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };

                            match sync_msg.msg_type {
                                MessageType::Join => {
                                    if membership.is_some() {
                                        log::debug!("Duplicate join from {addr} ignored");
                                        continue;
                                    }
                                    let room_id = if path_room.is_empty() {
                                        sync_msg.room_id.clone()
                                    } else {
                                        path_room.to_string()
                                    };
                                    let client_id = if sync_msg.client_id.is_nil() {
                                        Uuid::new_v4()
                                    } else {
                                        sync_msg.client_id
                                    };

                                    if sessions.client_count(&room_id).await >= config.max_clients_per_room {
                                        log::warn!("Room {room_id} full, rejecting {client_id}");
                                        let reject = SyncMessage::error(&room_id, "room is full");
                                        ws_sender.send(Message::Binary(reject.encode()?.into())).await?;
                                        break;
                                    }

                                    let request = match sync_msg.join_request() {
                                        Ok(r) => r,
                                        Err(e) => {
                                            let reject = SyncMessage::error(&room_id, &e.to_string());
                                            ws_sender.send(Message::Binary(reject.encode()?.into())).await?;
                                            break;
                                        }
                                    };

                                    let (handle, rx) = ClientHandle::new(
                                        client_id,
                                        config.session.outbound_capacity,
                                    );
                                    let connection = handle.connection;
                                    let response = sessions
                                        .join_room_with_state(&room_id, handle, &request.state_vector)
                                        .await?;
                                    *membership = Some((room_id.clone(), client_id, connection));
                                    outbound_rx = Some(rx);

                                    // Snapshot goes out before anything queued after the join
                                    let encoded = response.to_message(&room_id)?.encode()?;
                                    ws_sender.send(Message::Binary(encoded.into())).await?;

                                    if let Some(presence) = request.presence {
                                        sessions.set_presence(&room_id, &client_id, presence).await?;
                                    }

                                    let mut s = stats.write().await;
                                    s.active_rooms = sessions.room_count().await;
                                }

                                MessageType::Update => {
                                    let Some((room_id, client_id, _)) = membership.as_ref() else {
                                        log::warn!("Update before join from {addr} ignored");
                                        continue;
                                    };
                                    match sessions.on_remote_update(room_id, client_id, &sync_msg.payload).await {
                                        Ok(_) => {}
                                        Err(CollabError::MalformedUpdate(e)) => {
                                            stats.write().await.rejected_updates += 1;
                                            let reject = SyncMessage::error(room_id, &e.to_string());
                                            ws_sender.send(Message::Binary(reject.encode()?.into())).await?;
                                            log::warn!("Disconnecting {client_id}: {e}");
                                            break;
                                        }
                                        Err(e) => {
                                            log::warn!("Update from {client_id} failed: {e}");
                                            break;
                                        }
                                    }
                                }

                                MessageType::Presence => {
                                    if let Some((room_id, client_id, _)) = membership.as_ref() {
                                        log::trace!("Presence from {client_id} in room {room_id}");
                                        sessions.set_presence(room_id, client_id, sync_msg.payload).await?;
                                    }
                                }

                                MessageType::Leave => {
                                    log::info!("Client at {addr} left");
                                    break;
                                }

                                MessageType::Ping => {
                                    let pong_id = match membership.as_ref() {
                                        Some((room_id, client_id, _)) => {
                                            sessions.touch_presence(room_id, client_id).await?;
                                            *client_id
                                        }
                                        None => sync_msg.client_id,
                                    };
                                    let pong = SyncMessage::pong(pong_id);
                                    ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                                }

                                _ => {
                                    log::debug!("Unhandled message type: {:?}", sync_msg.msg_type);
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing message queued by the room
                out = next_outbound(&mut outbound_rx) => {
                    match out {
                        Some(data) => {
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        None => {
                            // The room dropped our queue: we fell too far behind.
                            let room_id = membership.as_ref().map(|(r, _, _)| r.clone()).unwrap_or_default();
                            log::warn!("Client at {addr} evicted as slow consumer");
                            let reject = SyncMessage::error(&room_id, "slow consumer");
                            let _ = ws_sender.send(Message::Binary(reject.encode()?.into())).await;
                            break;
                        }
                    }
                }

                _ = &mut deadline => {
                    log::info!("Connection from {addr} idle for {idle:?}, dropping");
                    break;
                }
            }
        }

        let _ = ws_sender.close().await;
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// The room registry shared by all connections.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }
}

async fn next_outbound(rx: &mut Option<mpsc::Receiver<Outbound>>) -> Option<Outbound> {
    match rx {
        Some(rx) => rx.recv().await,
        // Not joined yet: wait forever
        None => std::future::pending().await,
    }
}
