//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐  /ws                     ┌── Room "doc-1" actor ──┐
//!             ├── connection task ──────┤                        ├── CheckpointStore
//! Client B ──┘   (select! socket/outbox)└── Room "doc-2" actor ──┘   (RocksDB / memory)
//!                        ▲                          │
//!                        └──── session outbox ◄─────┘
//! ```
//!
//! Each connection is one task. Inbound frames are decoded and forwarded to
//! the session's room as commands; everything the room sends comes back
//! through the session's bounded outbox. When the room drops the session
//! (lagging, timed out, room torn down) the outbox closes and so does the
//! connection; the client reconnects and resyncs.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{outbox, OutboxReceiver};
use crate::config::ServerConfig;
use crate::error::CollabError;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::registry::RoomRegistry;
use crate::room::{JoinRequest, RoomHandle};
use crate::session::Cursor;
use crate::storage::{CheckpointStore, MemoryStore, RocksStore, StoreConfig};

/// Path of the sync endpoint.
pub const WS_PATH: &str = "/ws";

/// Handshake header carrying an identity validated by the auth layer.
pub const PARTICIPANT_HEADER: &str = "x-participant-id";

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Frames that failed to decode
    pub rejected_messages: u64,
    pub active_rooms: usize,
}

/// The sync server.
pub struct SyncServer {
    config: Arc<ServerConfig>,
    registry: Arc<RoomRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server. Opens RocksDB when `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, CollabError> {
        let store: Option<Arc<dyn CheckpointStore>> = match &config.storage_path {
            Some(path) => {
                let store = RocksStore::open(StoreConfig::at(path))?;
                log::info!("Checkpoints stored in {}", store.path().display());
                Some(Arc::new(store))
            }
            None => None,
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server with an explicit checkpoint store.
    pub fn with_store(config: ServerConfig, store: Option<Arc<dyn CheckpointStore>>) -> Self {
        let config = Arc::new(config);
        Self {
            registry: Arc::new(RoomRegistry::new(config.clone(), store)),
            config,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Default configuration with checkpoints kept in memory.
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Some(Arc::new(MemoryStore::new())))
    }

    /// Bind to the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), CollabError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Bind, serve until `shutdown` resolves, then stop every room behind a
    /// clean checkpoint.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), CollabError>
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::select! {
            result = self.run() => result,
            _ = shutdown => {
                let saved = self.registry.shutdown_all().await;
                log::info!("Shutting down; checkpointed {saved} rooms");
                Ok(())
            }
        }
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), CollabError> {
        if let Ok(addr) = listener.local_addr() {
            log::info!("Sync server listening on {addr}");
        }

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    log::error!("Accept failed: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<RoomRegistry>,
        stats: Arc<RwLock<ServerStats>>,
        config: Arc<ServerConfig>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut authenticated: Option<String> = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            if req.uri().path() != WS_PATH {
                let mut err = ErrorResponse::new(Some(format!("no endpoint at {}", req.uri().path())));
                *err.status_mut() = StatusCode::NOT_FOUND;
                return Err(err);
            }
            authenticated = req
                .headers()
                .get(PARTICIPANT_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string);
            Ok(resp)
        })
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut conn = Connection {
            registry: registry.clone(),
            outbox_capacity: config.outbox_capacity,
            authenticated,
            joined: None,
            outbox_rx: None,
        };

        let result = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let decoded = match msg {
                        Some(Ok(Message::Text(text))) => {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += text.len() as u64;
                            ClientMessage::decode(text.as_str())
                        }
                        Some(Ok(Message::Binary(data))) => {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                            ClientMessage::decode_bytes(&data)
                        }
                        Some(Ok(Message::Ping(data))) => {
                            conn.touch().await;
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break Ok(());
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break Ok(());
                        }
                        Some(Ok(_)) => continue,
                    };

                    let reply = match decoded {
                        Ok(msg) => conn.dispatch(msg).await,
                        Err(e) => {
                            log::warn!("Failed to decode message from {addr}: {e}");
                            stats.write().await.rejected_messages += 1;
                            Some(ServerMessage::error("protocol", e.to_string()))
                        }
                    };
                    if let Some(reply) = reply {
                        let frame = reply.encode()?;
                        if let Err(e) = ws_sender.send(Message::Text(String::from(&*frame).into())).await {
                            break Err(e.into());
                        }
                    }
                }

                frame = async {
                    match conn.outbox_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        // Not joined yet: wait forever
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Some(frame) => {
                            if let Err(e) = ws_sender.send(Message::Text(String::from(&*frame).into())).await {
                                break Err(e.into());
                            }
                        }
                        None => {
                            log::info!("Session for {addr} was dropped by its room; closing");
                            conn.joined = None;
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break Ok(());
                        }
                    }
                }
            }
        };

        // Cleanup: leave the room
        conn.leave().await;
        registry.prune().await;
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = registry.room_count().await;
        }
        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.registry.room_count().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// The room session a connection is attached to.
struct Joined {
    handle: RoomHandle,
    session_id: Uuid,
}

/// Per-connection state.
struct Connection {
    registry: Arc<RoomRegistry>,
    outbox_capacity: usize,
    authenticated: Option<String>,
    joined: Option<Joined>,
    outbox_rx: Option<OutboxReceiver>,
}

impl Connection {
    /// Forward one client message. Returns a reply to send directly on the
    /// socket; everything else arrives through the outbox.
    async fn dispatch(&mut self, msg: ClientMessage) -> Option<ServerMessage> {
        let result = match msg {
            ClientMessage::Join {
                room_id,
                participant_id,
                last_revision,
                epoch,
            } => return self.join(room_id, participant_id, last_revision, epoch).await,
            ClientMessage::Ping => match &self.joined {
                Some(j) => j.handle.ping(j.session_id).await,
                None => return Some(ServerMessage::Pong),
            },
            ClientMessage::Leave => {
                self.leave().await;
                Ok(())
            }
            ClientMessage::Op {
                base_revision,
                operation,
                correlation,
            } => match &self.joined {
                Some(j) => {
                    j.handle
                        .submit(j.session_id, operation, base_revision, correlation)
                        .await
                }
                None => Err(CollabError::NotJoined),
            },
            ClientMessage::Cursor {
                position,
                selection_end,
            } => match &self.joined {
                Some(j) => {
                    j.handle
                        .update_cursor(j.session_id, Cursor::new(position, selection_end))
                        .await
                }
                None => Err(CollabError::NotJoined),
            },
            ClientMessage::Snapshot => match &self.joined {
                Some(j) => j.handle.send_snapshot(j.session_id).await,
                None => Err(CollabError::NotJoined),
            },
            ClientMessage::Resync { last_revision } => match &self.joined {
                Some(j) => j.handle.resync(j.session_id, last_revision).await,
                None => Err(CollabError::NotJoined),
            },
        };

        match result {
            Ok(()) => None,
            Err(e) => {
                if matches!(e, CollabError::RoomClosed(_)) {
                    self.joined = None;
                    self.outbox_rx = None;
                }
                Some(ServerMessage::error(e.kind(), e.to_string()))
            }
        }
    }

    async fn join(
        &mut self,
        room_id: String,
        participant_id: Option<String>,
        last_revision: Option<u64>,
        epoch: Option<Uuid>,
    ) -> Option<ServerMessage> {
        if let Some(j) = &self.joined {
            let err = ProtocolError::InvalidMessageType(format!(
                "already joined room {}; leave first",
                j.handle.room_id()
            ));
            return Some(ServerMessage::error("protocol", err.to_string()));
        }

        let (tx, rx) = outbox(self.outbox_capacity);
        let request = JoinRequest {
            authenticated: self.authenticated.clone(),
            participant_id,
            last_revision,
            epoch,
            outbox: tx,
        };
        match self.registry.join(&room_id, request).await {
            Ok((handle, accepted)) => {
                log::debug!(
                    "Connection joined room {room_id} as {} ({})",
                    accepted.participant_id,
                    accepted.session_id
                );
                self.joined = Some(Joined {
                    handle,
                    session_id: accepted.session_id,
                });
                self.outbox_rx = Some(rx);
                None
            }
            Err(e) => {
                log::warn!("Join of room {room_id} refused: {e}");
                Some(ServerMessage::error(e.kind(), e.to_string()))
            }
        }
    }

    /// Liveness for a joined session, from socket-level pings.
    async fn touch(&mut self) {
        let result = match &self.joined {
            Some(j) => j.handle.touch(j.session_id).await,
            None => return,
        };
        if let Err(e) = result {
            log::debug!("Liveness signal dropped: {e}");
            if matches!(e, CollabError::RoomClosed(_)) {
                self.joined = None;
                self.outbox_rx = None;
            }
        }
    }

    async fn leave(&mut self) {
        self.outbox_rx = None;
        if let Some(j) = self.joined.take() {
            if let Err(e) = j.handle.leave(j.session_id).await {
                log::debug!("Leave of {} ignored: {e}", j.session_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert!(server.registry().store().is_some());
    }

    #[test]
    fn test_server_without_store() {
        let server = SyncServer::new(ServerConfig::for_testing()).unwrap();
        assert!(server.registry().store().is_none());
        assert_eq!(server.config().outbox_capacity, 64);
    }

    #[tokio::test]
    async fn test_server_with_rocks_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::for_testing()
        };
        let server = SyncServer::new(config).unwrap();
        assert!(server.registry().store().is_some());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.rejected_messages, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    fn connection() -> (Connection, Arc<RoomRegistry>) {
        let registry = Arc::new(RoomRegistry::new(Arc::new(ServerConfig::for_testing()), None));
        let conn = Connection {
            registry: registry.clone(),
            outbox_capacity: 16,
            authenticated: None,
            joined: None,
            outbox_rx: None,
        };
        (conn, registry)
    }

    #[tokio::test]
    async fn test_dispatch_before_join() {
        let (mut conn, _) = connection();
        assert_eq!(conn.dispatch(ClientMessage::Ping).await, Some(ServerMessage::Pong));
        match conn.dispatch(ClientMessage::Snapshot).await {
            Some(ServerMessage::Error { kind, .. }) => assert_eq!(kind, "notJoined"),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_join_then_double_join() {
        let (mut conn, registry) = connection();
        let join = ClientMessage::Join {
            room_id: "lobby".into(),
            participant_id: Some("alice".into()),
            last_revision: None,
            epoch: None,
        };
        assert_eq!(conn.dispatch(join.clone()).await, None);
        assert!(conn.joined.is_some());
        assert_eq!(registry.room_count().await, 1);

        let rx = conn.outbox_rx.as_mut().unwrap();
        assert!(matches!(
            ServerMessage::decode(&rx.recv().await.unwrap()).unwrap(),
            ServerMessage::Snapshot { .. }
        ));
        assert!(matches!(
            ServerMessage::decode(&rx.recv().await.unwrap()).unwrap(),
            ServerMessage::Joined { .. }
        ));

        match conn.dispatch(join).await {
            Some(ServerMessage::Error { kind, .. }) => assert_eq!(kind, "protocol"),
            other => panic!("expected error, got {other:?}"),
        }

        conn.dispatch(ClientMessage::Leave).await;
        assert!(conn.joined.is_none());
        assert!(conn.outbox_rx.is_none());
    }

    #[tokio::test]
    async fn test_socket_ping_keeps_session_alive() {
        let registry = Arc::new(RoomRegistry::new(
            Arc::new(ServerConfig {
                liveness_timeout: std::time::Duration::from_millis(150),
                ..ServerConfig::for_testing()
            }),
            None,
        ));
        let mut conn = Connection {
            registry: registry.clone(),
            outbox_capacity: 16,
            authenticated: None,
            joined: None,
            outbox_rx: None,
        };
        conn.touch().await;
        let join = ClientMessage::Join {
            room_id: "lobby".into(),
            participant_id: Some("alice".into()),
            last_revision: None,
            epoch: None,
        };
        assert_eq!(conn.dispatch(join).await, None);

        for _ in 0..8 {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            conn.touch().await;
        }
        let handle = registry.get("lobby").await.unwrap();
        assert_eq!(handle.inspect().await.unwrap().sessions, 1);
    }

    #[tokio::test]
    async fn test_dispatch_rejected_identity() {
        let (mut conn, _) = connection();
        conn.authenticated = Some("alice".into());
        let reply = conn
            .dispatch(ClientMessage::Join {
                room_id: "lobby".into(),
                participant_id: Some("mallory".into()),
                last_revision: None,
                epoch: None,
            })
            .await;
        match reply {
            Some(ServerMessage::Error { kind, .. }) => assert_eq!(kind, "rejected"),
            other => panic!("expected error, got {other:?}"),
        }
        assert!(conn.joined.is_none());
    }
}
