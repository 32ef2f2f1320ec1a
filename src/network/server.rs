//! WebSocket Lobby Server
//!
//! Async WebSocket server for the game lobby.
//! Accepts connections, dispatches inbound frames to the lobby, pings
//! for liveness, and runs the credential sweep in the background.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, instrument, warn};

use crate::game::session::SessionConfig;
use crate::network::auth::AuthConfig;
use crate::network::hub::{ConnectionId, Outbound};
use crate::network::lobby::{Lobby, LobbyError};
use crate::network::protocol::{
    AuthResult, ClientMessage, Envelope, ErrorCode, ServerMessage, TokenList,
};

/// How long a closing connection gets to flush its queue.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Interval between liveness pings.
    pub heartbeat_interval: Duration,
    /// Silence after which a connection is dropped.
    pub heartbeat_timeout: Duration,
    /// Per-connection outbound queue capacity.
    pub outbound_queue_size: usize,
    /// Interval between credential sweeps.
    pub token_sweep_interval: Duration,
    /// Deployment environment name.
    pub environment: String,
    /// Server version string.
    pub version: String,
    /// Roster limits.
    pub session: SessionConfig,
    /// Credential settings.
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            outbound_queue_size: 64,
            token_sweep_interval: Duration::from_secs(3600),
            environment: "production".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            session: SessionConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, GameServerError> {
        let defaults = Self::default();

        let bind_addr = match std::env::var("SERVER_ADDRESS") {
            Ok(addr) if !addr.is_empty() => parse_bind_addr(&addr)?,
            _ => defaults.bind_addr,
        };

        let session = SessionConfig {
            min_players: env_parse("MIN_PLAYERS_TO_START")?
                .unwrap_or(defaults.session.min_players),
            ..defaults.session
        };

        let config = Self {
            bind_addr,
            max_connections: env_parse("MAX_CONNECTIONS")?.unwrap_or(defaults.max_connections),
            heartbeat_interval: env_parse("HEARTBEAT_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            heartbeat_timeout: env_parse("HEARTBEAT_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_timeout),
            outbound_queue_size: defaults.outbound_queue_size,
            token_sweep_interval: env_parse("TOKEN_SWEEP_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.token_sweep_interval),
            environment: std::env::var("APP_ENV").unwrap_or(defaults.environment),
            version: defaults.version,
            session,
            auth: AuthConfig::from_env(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), GameServerError> {
        let non_zero = [
            ("heartbeat interval", self.heartbeat_interval),
            ("heartbeat timeout", self.heartbeat_timeout),
            ("token sweep interval", self.token_sweep_interval),
        ];
        for (name, value) in non_zero {
            if value.is_zero() {
                return Err(GameServerError::Config(format!("{} must be non-zero", name)));
            }
        }

        if self.max_connections == 0 {
            return Err(GameServerError::Config("max connections must be non-zero".into()));
        }
        if self.outbound_queue_size == 0 {
            return Err(GameServerError::Config("outbound queue size must be non-zero".into()));
        }

        let SessionConfig {
            max_players,
            min_players,
        } = self.session;
        if max_players == 0 || max_players > usize::from(u8::MAX) {
            return Err(GameServerError::Config(format!(
                "max players must be between 1 and {}, got {}",
                u8::MAX,
                max_players
            )));
        }
        if min_players == 0 || min_players > max_players {
            return Err(GameServerError::Config(format!(
                "players to start must be between 1 and {}, got {}",
                max_players, min_players
            )));
        }

        Ok(())
    }

    /// Whether running in the development environment.
    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }
}

/// Accepts `host:port` or the bare `:port` form, which binds every interface.
fn parse_bind_addr(addr: &str) -> Result<SocketAddr, GameServerError> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    full.parse().map_err(|_| {
        GameServerError::Config(format!("SERVER_ADDRESS is not a socket address: {}", addr))
    })
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, GameServerError> {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value.parse().map(Some).map_err(|_| {
            GameServerError::Config(format!("{} has an invalid value: {}", key, value))
        }),
        _ => Ok(None),
    }
}

/// Resolves once shutdown has been requested or the server is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    if *rx.borrow_and_update() {
        return;
    }
    while rx.changed().await.is_ok() {
        if *rx.borrow_and_update() {
            return;
        }
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Lobby error.
    #[error("Lobby error: {0}")]
    Lobby(#[from] LobbyError),
}

/// The lobby server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Sessions, connections, credentials.
    lobby: Arc<Lobby>,
    /// Shutdown flag. Latched, so a request made before `serve` still counts.
    shutdown_tx: watch::Sender<bool>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let lobby = Arc::new(Lobby::new(config.session, config.auth.clone()));

        Self {
            config,
            lobby,
            shutdown_tx,
        }
    }

    /// Bind the configured address and serve until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        self.config.validate()?;
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        self.config.validate()?;
        info!("Lobby server listening on {}", listener.local_addr()?);

        if !self.config.auth.is_configured() {
            warn!("ACCESS_TOKEN_SECRET not set, credential issuance disabled");
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let sweeper = self
            .lobby
            .token_registry()
            .spawn_sweeper(self.config.token_sweep_interval);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let connections = self.lobby.hub().connection_count().await;
                            if connections >= self.config.max_connections {
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
                _ = shutdown_requested(&mut shutdown_rx) => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        sweeper.stop().await;

        // Give connection tasks a chance to deliver the shutdown frame
        let hub = self.lobby.hub();
        let drained = timeout(WRITER_DRAIN_TIMEOUT, async {
            while hub.connection_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("{} connections still open at shutdown", hub.connection_count().await);
        }

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let lobby = self.lobby.clone();
        let config = self.config.clone();
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
            let (frame_tx, mut frame_rx) = mpsc::channel::<Outbound>(config.outbound_queue_size);
            let hub = lobby.hub().clone();
            let conn_id = hub.register(frame_tx).await;

            // Writer: the hub holds the only sender, so this ends on deregister
            let mut writer = tokio::spawn(async move {
                while let Some(frame) = frame_rx.recv().await {
                    let msg = match frame {
                        Outbound::Text(text) => Message::Text(text.to_string()),
                        Outbound::Ping => Message::Ping(Vec::new()),
                    };
                    if ws_sender.send(msg).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sender.close().await;
            });

            let period = config.heartbeat_interval;
            let mut heartbeat = interval_at(Instant::now() + period, period);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_seen = Instant::now();

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                last_seen = Instant::now();
                                Self::dispatch(&lobby, conn_id, &text, &config.version).await;
                            }
                            Some(Ok(Message::Binary(_))) => {
                                last_seen = Instant::now();
                                let reply = Envelope::error(
                                    ErrorCode::InvalidMessage,
                                    "Binary frames are not supported",
                                );
                                hub.send_to(conn_id, &reply).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Ok(_)) => {
                                // Ping, pong
                                last_seen = Instant::now();
                            }
                            Some(Err(e)) => {
                                warn!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                        }
                    }
                    _ = heartbeat.tick() => {
                        if last_seen.elapsed() > config.heartbeat_timeout {
                            info!("Client {} timed out", addr);
                            break;
                        }
                        if !hub.send_frame(conn_id, Outbound::Ping).await {
                            debug!("Client {} dropped by hub", addr);
                            break;
                        }
                    }
                    _ = shutdown_requested(&mut shutdown_rx) => {
                        let notice = Envelope::new(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        });
                        hub.send_to(conn_id, &notice).await;
                        break;
                    }
                }
            }

            // Cleanup
            let connected_for = hub.connected_for(conn_id).await;
            hub.deregister(conn_id).await;
            if timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
                writer.abort();
            }

            info!("Client {} cleaned up (connected {:?})", addr, connected_for.unwrap_or_default());
        });
    }

    /// Route one inbound text frame. Failures go back to the sender only.
    async fn dispatch(lobby: &Lobby, conn_id: ConnectionId, text: &str, version: &str) {
        let hub = lobby.hub();
        let msg = match ClientMessage::from_json(text) {
            Ok(m) => m,
            Err(e) => {
                debug!("Invalid message from {}: {}", conn_id, e);
                let reply = Envelope::error(ErrorCode::InvalidMessage, "Invalid message format");
                hub.send_to(conn_id, &reply).await;
                return;
            }
        };

        let result = match msg {
            ClientMessage::Auth(payload) => {
                Self::handle_auth(lobby, conn_id, &payload.username, version).await;
                Ok(())
            }
            ClientMessage::JoinGame(payload) => lobby.join(&payload.username).await.map(|_| ()),
            ClientMessage::LeaveGame(payload) => lobby.leave(&payload.username).await.map(|_| ()),
            ClientMessage::StartGame(payload) => lobby.start(&payload.username).await.map(|_| ()),
            ClientMessage::PauseGame(payload) => lobby.pause(&payload.username).await.map(|_| ()),
            ClientMessage::ResumeGame(payload) => {
                lobby.resume(&payload.username).await.map(|_| ())
            }
            ClientMessage::EndGame(payload) => lobby.end(&payload.username).await.map(|_| ()),
            ClientMessage::GetState => {
                let state = lobby.state().await;
                hub.send_to(conn_id, &Envelope::new(ServerMessage::State(state))).await;
                Ok(())
            }
            ClientMessage::ListTokens(request) => match lobby.tokens(&request.token).await {
                Ok(tokens) => {
                    let reply = ServerMessage::Tokens(TokenList { tokens });
                    hub.send_to(conn_id, &Envelope::new(reply)).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
        };

        if let Err(e) = result {
            debug!("Request from {} rejected: {}", conn_id, e);
            hub.send_to(conn_id, &Envelope::error(e.code(), e.to_string())).await;
        }
    }

    /// Bind the identity to the connection and reply with a credential.
    async fn handle_auth(lobby: &Lobby, conn_id: ConnectionId, username: &str, version: &str) {
        let hub = lobby.hub();
        let username = username.trim();
        if username.is_empty() {
            let e = LobbyError::InvalidUsername;
            hub.send_to(conn_id, &Envelope::error(e.code(), e.to_string())).await;
            return;
        }

        hub.associate(conn_id, username).await;

        let result = match lobby.login(username).await {
            Ok(issued) => AuthResult {
                success: true,
                username: username.to_string(),
                token: Some(issued.token),
                expires_at: Some(issued.expires_at),
                error: None,
                server_version: version.to_string(),
            },
            Err(e) => {
                warn!("Credential issuance for {} failed: {}", username, e);
                AuthResult {
                    success: false,
                    username: username.to_string(),
                    token: None,
                    expires_at: None,
                    error: Some(e.to_string()),
                    server_version: version.to_string(),
                }
            }
        };

        hub.send_to(conn_id, &Envelope::new(ServerMessage::AuthResult(result))).await;
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Shared lobby state.
    pub fn lobby(&self) -> &Arc<Lobby> {
        &self.lobby
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.lobby.hub().connection_count().await
    }

    /// Get session count.
    pub async fn session_count(&self) -> usize {
        self.lobby.sessions().session_count().await
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::task::JoinHandle;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;
    type ServeHandle = JoinHandle<Result<(), GameServerError>>;

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            session: SessionConfig {
                min_players: 2,
                ..Default::default()
            },
            auth: AuthConfig {
                secret: Some("server-test-secret".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn start_server(config: ServerConfig) -> (Arc<GameServer>, SocketAddr, ServeHandle) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(GameServer::new(config));

        let running = server.clone();
        let handle = tokio::spawn(async move { running.serve(listener).await });
        (server, addr, handle)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let url = format!("ws://{}", addr);
        let (client, _) = connect_async(url.as_str()).await.unwrap();
        client
    }

    async fn send(client: &mut Client, kind: &str, username: &str) {
        let text = json!({ "type": kind, "data": { "username": username } }).to_string();
        client.send(Message::Text(text)).await.unwrap();
    }

    async fn send_json(client: &mut Client, value: Value) {
        client.send(Message::Text(value.to_string())).await.unwrap();
    }

    async fn next_json(client: &mut Client) -> Value {
        loop {
            let msg = timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    /// Round trip through `get_state`; once answered, the connection is registered.
    async fn get_state(client: &mut Client) -> Value {
        send_json(client, json!({ "type": "get_state" })).await;
        let frame = next_json(client).await;
        assert_eq!(frame["type"], "state");
        frame
    }

    async fn wait_for_connections(server: &GameServer, expected: usize) -> bool {
        for _ in 0..200 {
            if server.connection_count().await == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.token_sweep_interval, Duration::from_secs(3600));
        assert_eq!(config.session.min_players, 3);
        assert!(!config.is_development());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_bind_addr() {
        let any = SocketAddr::from(([0, 0, 0, 0], 9000));
        let local = SocketAddr::from(([127, 0, 0, 1], 8081));
        assert_eq!(parse_bind_addr(":9000").unwrap(), any);
        assert_eq!(parse_bind_addr("127.0.0.1:8081").unwrap(), local);
        assert!(matches!(parse_bind_addr("localhost"), Err(GameServerError::Config(_))));
    }

    #[test]
    fn test_config_rejects_zero_periods() {
        let configs = [
            ServerConfig {
                heartbeat_interval: Duration::ZERO,
                ..test_config()
            },
            ServerConfig {
                heartbeat_timeout: Duration::ZERO,
                ..test_config()
            },
            ServerConfig {
                token_sweep_interval: Duration::ZERO,
                ..test_config()
            },
            ServerConfig {
                max_connections: 0,
                ..test_config()
            },
            ServerConfig {
                outbound_queue_size: 0,
                ..test_config()
            },
        ];

        for config in configs {
            assert!(matches!(config.validate(), Err(GameServerError::Config(_))));
        }
    }

    #[test]
    fn test_config_rejects_bad_player_limits() {
        let limits = [(7, 0), (7, 8), (0, 0), (300, 3)];

        for (max_players, min_players) in limits {
            let config = ServerConfig {
                session: SessionConfig {
                    max_players,
                    min_players,
                },
                ..test_config()
            };
            assert!(
                matches!(config.validate(), Err(GameServerError::Config(_))),
                "accepted max {} min {}",
                max_players,
                min_players
            );
        }

        let config = ServerConfig {
            session: SessionConfig {
                max_players: 7,
                min_players: 7,
            },
            ..test_config()
        };
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_serve_rejects_invalid_config() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = GameServer::new(ServerConfig {
            heartbeat_interval: Duration::ZERO,
            ..test_config()
        });

        let result = timeout(Duration::from_secs(2), server.serve(listener)).await;
        assert!(matches!(result, Ok(Err(GameServerError::Config(_)))));
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = GameServer::new(test_config());

        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let (server, _addr, handle) = start_server(test_config()).await;
        tokio::task::yield_now().await;

        server.shutdown();
        let result = timeout(Duration::from_secs(2), handle).await;
        assert!(result.unwrap().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_before_serve() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = GameServer::new(test_config());

        server.shutdown();
        let result = timeout(Duration::from_secs(2), server.serve(listener)).await;
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_silent_client_is_dropped() {
        let config = ServerConfig {
            heartbeat_interval: Duration::from_millis(50),
            heartbeat_timeout: Duration::from_millis(200),
            ..test_config()
        };
        let (server, addr, handle) = start_server(config).await;

        // Traffic well past the timeout keeps the connection open
        let mut client = connect(addr).await;
        for _ in 0..8 {
            get_state(&mut client).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(server.connection_count().await, 1);

        // Unpolled, the client answers no pings
        assert!(wait_for_connections(&server, 0).await);

        server.shutdown();
        assert!(handle.await.unwrap().is_ok());
        drop(client);
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let config = ServerConfig {
            max_connections: 1,
            ..test_config()
        };
        let (server, addr, handle) = start_server(config).await;

        let mut first = connect(addr).await;
        get_state(&mut first).await;
        assert_eq!(server.connection_count().await, 1);

        let url = format!("ws://{}", addr);
        assert!(connect_async(url.as_str()).await.is_err());

        drop(first);
        assert!(wait_for_connections(&server, 0).await);

        let mut second = connect(addr).await;
        get_state(&mut second).await;
        assert_eq!(server.connection_count().await, 1);

        server.shutdown();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_end_to_end_lobby_flow() {
        let (server, addr, handle) = start_server(test_config()).await;

        // A reply proves each connection is registered before broadcasts begin
        let mut viewer = connect(addr).await;
        viewer.send(Message::Text("not json".into())).await.unwrap();
        let frame = next_json(&mut viewer).await;
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["data"]["code"], "invalid_message");

        send(&mut viewer, "auth", "   ").await;
        let frame = next_json(&mut viewer).await;
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["data"]["code"], "invalid_username");

        let frame = get_state(&mut viewer).await;
        assert!(frame["data"]["game"].is_null());
        assert_eq!(frame["data"]["connected_users"], json!([]));

        let mut alice = connect(addr).await;
        send(&mut alice, "auth", "alice").await;
        for client in [&mut alice, &mut viewer] {
            let frame = next_json(client).await;
            assert_eq!(frame["type"], "user_connected");
            assert_eq!(frame["from"], "alice");
            assert_eq!(frame["data"]["username"], "alice");
        }
        let frame = next_json(&mut alice).await;
        assert_eq!(frame["type"], "auth_result");
        assert_eq!(frame["data"]["success"], true);
        assert_eq!(frame["data"]["username"], "alice");
        let token = frame["data"]["token"].as_str().unwrap().to_string();

        send_json(&mut alice, json!({ "type": "list_tokens", "data": { "token": token } })).await;
        let frame = next_json(&mut alice).await;
        assert_eq!(frame["type"], "tokens");
        assert!(frame["data"]["tokens"]["alice"].is_string());

        send_json(&mut viewer, json!({ "type": "list_tokens", "data": { "token": "forged" } }))
            .await;
        let frame = next_json(&mut viewer).await;
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["data"]["code"], "auth_failed");

        send(&mut alice, "join_game", "alice").await;
        for client in [&mut alice, &mut viewer] {
            let frame = next_json(client).await;
            assert_eq!(frame["type"], "player_joined");
            assert_eq!(frame["from"], "alice");
            assert_eq!(frame["data"]["game"]["players"]["alice"]["position"], 1);
        }

        // Rejections go to the sender only
        send(&mut alice, "start_game", "alice").await;
        let frame = next_json(&mut alice).await;
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["data"]["code"], "not_enough_players");

        send(&mut viewer, "join_game", "bob").await;
        for client in [&mut alice, &mut viewer] {
            let frame = next_json(client).await;
            assert_eq!(frame["type"], "player_joined");
            assert_eq!(frame["data"]["game"]["players"]["bob"]["position"], 2);
        }

        send(&mut viewer, "start_game", "bob").await;
        for client in [&mut alice, &mut viewer] {
            let frame = next_json(client).await;
            assert_eq!(frame["type"], "game_started");
            assert_eq!(frame["data"]["game"]["state"], "STARTED");
        }

        // A late arrival catches up without waiting for the next broadcast
        let mut late = connect(addr).await;
        let frame = get_state(&mut late).await;
        assert_eq!(frame["data"]["game"]["state"], "STARTED");
        assert_eq!(frame["data"]["game"]["players"]["bob"]["position"], 2);
        assert_eq!(frame["data"]["connected_users"], json!(["alice"]));

        server.shutdown();
        for client in [&mut alice, &mut viewer, &mut late] {
            let frame = next_json(client).await;
            assert_eq!(frame["type"], "shutdown");
        }

        assert!(handle.await.unwrap().is_ok());
    }
}
