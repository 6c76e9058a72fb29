//! WebSocket Game Server
//!
//! Accepts sockets, binds each one to a roster entry through `joinMatch`,
//! and forwards gameplay messages to the owning match task.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;
use crate::game::engine::MatchEngine;
use crate::game::spell::SpellCatalog;
use crate::game::state::UserId;
use crate::network::auth::authenticate;
use crate::network::protocol::{
    ClientMessage, ErrorCode, JoinRequest, JoinedInfo, ServerError, ServerMessage,
};
use crate::network::roster::{CharacterDirectory, RoomDocument, RosterError};
use crate::network::session::{ConnectionId, MatchCommand, MatchHandle, SessionError, SessionManager};

/// Outbound queue depth per socket.
const OUTBOUND_CAPACITY: usize = 64;

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// Room document rejected.
    #[error("Room error: {0}")]
    Room(#[from] RosterError),

    /// Session error.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Connected client state.
struct ConnectedClient {
    /// Socket id.
    connection: ConnectionId,
    /// Bound identity, after `joinMatch`.
    user_id: Option<UserId>,
    /// Match the socket is attached to.
    handle: Option<MatchHandle>,
    /// Connection time.
    connected_at: Instant,
}

/// State every connection task needs.
#[derive(Clone)]
struct Shared {
    config: Arc<ServerConfig>,
    sessions: SessionManager,
    clients: Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>,
}

/// The game server.
pub struct GameServer {
    shared: Shared,
    catalog: Arc<SpellCatalog>,
    directory: Arc<dyn CharacterDirectory>,
    next_connection: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(config: ServerConfig, catalog: Arc<SpellCatalog>, directory: Arc<dyn CharacterDirectory>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shared: Shared {
                config: Arc::new(config),
                sessions: SessionManager::new(),
                clients: Arc::new(RwLock::new(BTreeMap::new())),
            },
            catalog,
            directory,
            next_connection: AtomicU64::new(1),
            shutdown_tx,
        }
    }

    /// Session registry.
    pub fn sessions(&self) -> &SessionManager {
        &self.shared.sessions
    }

    /// Open a room from a trusted room document.
    pub async fn open_room(&self, room: &RoomDocument) -> Result<MatchHandle, GameServerError> {
        let state = room.build_match()?;
        let engine = MatchEngine::new(state, Arc::clone(&self.catalog), self.shared.config.timings);
        let handle = self.shared.sessions.open_match(engine, Arc::clone(&self.directory)).await?;
        info!(match_id = %handle.match_id(), map_id = %room.map_id, "room opened");
        Ok(handle)
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    #[instrument(skip_all)]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        info!("Game server listening on {}", listener.local_addr()?);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.shared.clients.read().await.len();
                            if clients_count >= self.shared.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.shared.sessions.shutdown_all("Server shutting down").await;
        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let shared = self.shared.clone();
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);

            shared.clients.write().await.insert(addr, ConnectedClient {
                connection,
                user_id: None,
                handle: None,
                connected_at: Instant::now(),
            });

            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sender.close().await;
            });

            let idle_timeout = shared.config.idle_timeout;
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                match ClientMessage::from_json(&text) {
                                    Ok(client_msg) => {
                                        Self::handle_client_message(addr, client_msg, &shared, &msg_tx).await;
                                    }
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        let _ = msg_tx
                                            .send(ServerError::message(ErrorCode::InvalidMessage, "Invalid message format"))
                                            .await;
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                warn!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            // tungstenite answers pings itself
                            Some(Ok(_)) => {}
                        }
                    }
                    _ = tokio::time::sleep(idle_timeout) => {
                        info!("Client {} idle for {:?}, closing", addr, idle_timeout);
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            // Cleanup
            let client = shared.clients.write().await.remove(&addr);
            if let Some(ConnectedClient { user_id: Some(user_id), handle: Some(handle), connected_at, .. }) = client {
                let _ = handle.send(MatchCommand::Detach { user_id: user_id.clone(), connection }).await;
                info!(user = %user_id, match_id = %handle.match_id(), online = ?connected_at.elapsed(), "player left");
            }
            drop(msg_tx);
            if tokio::time::timeout(Duration::from_secs(1), sender_task).await.is_err() {
                debug!("Outbound queue for {} did not drain", addr);
            }

            info!("Client {} cleaned up", addr);
        });
    }

    /// Handle a client message.
    async fn handle_client_message(
        addr: SocketAddr,
        msg: ClientMessage,
        shared: &Shared,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        match msg {
            ClientMessage::JoinMatch(req) => {
                if let Err((code, message)) = Self::handle_join(addr, req, shared, sender).await {
                    let _ = sender.send(ServerError::message(code, message)).await;
                }
            }
            ClientMessage::Ping { timestamp } => {
                let _ = sender.send(ServerMessage::pong(timestamp)).await;
            }
            gameplay => {
                let bound = {
                    let clients = shared.clients.read().await;
                    clients
                        .get(&addr)
                        .and_then(|c| Some((c.user_id.clone()?, c.handle.clone()?)))
                };
                let Some((user_id, handle)) = bound else {
                    let _ = sender.send(ServerError::message(ErrorCode::NotJoined, "Join a match first")).await;
                    return;
                };
                if handle.send(MatchCommand::Client { user_id, message: gameplay }).await.is_err() {
                    let _ = sender.send(ServerError::message(ErrorCode::MatchClosed, "Match has ended")).await;
                }
            }
        }
    }

    /// Authenticate and attach to a match.
    async fn handle_join(
        addr: SocketAddr,
        req: JoinRequest,
        shared: &Shared,
        sender: &mpsc::Sender<ServerMessage>,
    ) -> Result<(), (ErrorCode, String)> {
        let connection = {
            let clients = shared.clients.read().await;
            match clients.get(&addr) {
                Some(c) if c.user_id.is_some() => {
                    return Err((ErrorCode::AlreadyJoined, "Socket already joined".into()));
                }
                Some(c) => c.connection,
                None => return Err((ErrorCode::InternalError, "Unknown connection".into())),
            }
        };

        let config = &shared.config;
        let user_id = authenticate(&req.token, &config.auth, config.allow_insecure_join).map_err(|e| {
            debug!("Join rejected for {}: {}", addr, e);
            (ErrorCode::AuthFailed, e.to_string())
        })?;

        let handle = shared
            .sessions
            .get(&req.match_id)
            .await
            .ok_or_else(|| session_error(SessionError::MatchNotFound(req.match_id.clone())))?;
        if !handle.has_player(&user_id) {
            return Err(session_error(SessionError::NotOnRoster(user_id)));
        }

        // joined must precede the snapshot the match sends on attach
        let _ = sender
            .send(ServerMessage::Joined(JoinedInfo { match_id: req.match_id.clone(), user_id: user_id.clone() }))
            .await;

        let handle = shared
            .sessions
            .join(&req.match_id, &user_id, connection, sender.clone())
            .await
            .map_err(session_error)?;

        if let Some(client) = shared.clients.write().await.get_mut(&addr) {
            client.user_id = Some(user_id.clone());
            client.handle = Some(handle);
        }
        info!(user = %user_id, match_id = %req.match_id, "Client {} joined", addr);
        Ok(())
    }

    /// Get connected client count.
    pub async fn connection_count(&self) -> usize {
        self.shared.clients.read().await.len()
    }

    /// Get running match count.
    pub async fn match_count(&self) -> usize {
        self.shared.sessions.match_count().await
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

fn session_error(err: SessionError) -> (ErrorCode, String) {
    let code = match err {
        SessionError::MatchNotFound(_) => ErrorCode::MatchNotFound,
        SessionError::NotOnRoster(_) | SessionError::AlreadyInMatch { .. } => ErrorCode::NotOnRoster,
        SessionError::MatchClosed(_) => ErrorCode::MatchClosed,
        SessionError::DuplicateMatch(_) => ErrorCode::InternalError,
    };
    (code, err.to_string())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::grid::Cell;
    use crate::game::engine::tests::catalog;
    use crate::game::state::{BaseStats, MatchPhase, Team};
    use crate::game::terrain::{MapDocument, StartZones, TileType};
    use crate::network::roster::{RosterMember, StaticCharacterDirectory};
    use tokio_tungstenite::connect_async;

    fn room() -> RoomDocument {
        let member = |id: &str, team| RosterMember {
            user_id: id.into(),
            username: id.into(),
            character_id: format!("char-{}", id),
            character_class: "mage".into(),
            team,
            spell_loadout: "arcane_bolt".into(),
        };
        RoomDocument {
            match_id: Some("room-1".into()),
            map_id: "arena".into(),
            map: MapDocument {
                terrain: vec![vec![TileType::Ground; 8]; 8],
                start_zones: StartZones {
                    a: vec![Cell::new(0, 0), Cell::new(0, 1)],
                    b: vec![Cell::new(7, 0), Cell::new(7, 1)],
                },
            },
            roster: vec![member("alice", Team::A), member("bob", Team::B)],
            base_stats: BaseStats::default(),
        }
    }

    fn server() -> Arc<GameServer> {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            allow_insecure_join: true,
            ..Default::default()
        };
        Arc::new(GameServer::new(config, Arc::new(catalog()), Arc::new(StaticCharacterDirectory::new())))
    }

    async fn next_server_message<S>(ws: &mut S) -> ServerMessage
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return ServerMessage::from_json(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = server();
        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.match_count().await, 0);

        server.open_room(&room()).await.unwrap();
        assert_eq!(server.match_count().await, 1);
        assert!(matches!(server.open_room(&room()).await, Err(GameServerError::Session(_))));
    }

    #[tokio::test]
    async fn test_join_and_ready_over_websocket() {
        let server = server();
        server.open_room(&room()).await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = Arc::clone(&server);
        let task = tokio::spawn(async move { serving.serve(listener).await });

        let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();

        // gameplay before join is refused
        ws.send(Message::Text(r#"{"type":"endTurn"}"#.into())).await.unwrap();
        let ServerMessage::Error(err) = next_server_message(&mut ws).await else { panic!("expected error") };
        assert_eq!(err.code, ErrorCode::NotJoined);

        ws.send(Message::Text(r#"{"type":"joinMatch","matchId":"room-1","token":"mallory"}"#.into()))
            .await
            .unwrap();
        let ServerMessage::Error(err) = next_server_message(&mut ws).await else { panic!("expected error") };
        assert_eq!(err.code, ErrorCode::NotOnRoster);

        ws.send(Message::Text(r#"{"type":"joinMatch","matchId":"room-1","token":"alice"}"#.into()))
            .await
            .unwrap();
        let ServerMessage::Joined(joined) = next_server_message(&mut ws).await else { panic!("expected joined") };
        assert_eq!(joined.user_id, "alice");
        let ServerMessage::GameState(state) = next_server_message(&mut ws).await else { panic!("expected gameState") };
        assert_eq!(state.state.phase, MatchPhase::Preparation);

        ws.send(Message::Text(r#"{"type":"playerReady","ready":true}"#.into())).await.unwrap();
        let ServerMessage::GameState(state) = next_server_message(&mut ws).await else { panic!("expected gameState") };
        assert!(state.state.player("alice").unwrap().ready);

        ws.send(Message::Text(r#"{"type":"ping","timestamp":7}"#.into())).await.unwrap();
        let ServerMessage::Pong(pong) = next_server_message(&mut ws).await else { panic!("expected pong") };
        assert_eq!(pong.timestamp, 7);

        server.shutdown();
        task.await.unwrap().unwrap();
    }
}
