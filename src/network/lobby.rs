//! Lobby Coordinator
//!
//! The one path through which the game roster and phase change. Every
//! successful mutation produces exactly one broadcast carrying the resulting
//! session snapshot; failures broadcast nothing.
//!
//! Mutations are serialized together with their broadcast, so viewers see
//! changes in the order they were applied and the last frame they hold is
//! the current state.

use std::collections::BTreeMap;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::game::registry::{RosterChange, SessionHandle, SessionRegistry};
use crate::game::session::{SessionConfig, SessionError, SessionSnapshot};
use crate::network::auth::{issue_token, validate_token, AuthConfig, AuthError, IssuedToken};
use crate::network::hub::BroadcastHub;
use crate::network::protocol::{
    Envelope, ErrorCode, GameEvent, LobbyState, ServerMessage, UserConnected,
};
use crate::network::tokens::TokenRegistry;

/// Lobby errors.
#[derive(Debug, thiserror::Error)]
pub enum LobbyError {
    /// Username empty or blank.
    #[error("Username must not be empty")]
    InvalidUsername,

    /// No session has been created yet.
    #[error("No active game")]
    NoActiveGame,

    /// Session rejected the request.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Credential issuance or validation failed.
    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl LobbyError {
    /// Wire error code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            LobbyError::InvalidUsername => ErrorCode::InvalidUsername,
            LobbyError::NoActiveGame => ErrorCode::NoActiveGame,
            LobbyError::Session(e) => match e {
                SessionError::SessionFull
                | SessionError::AlreadyInSession(_)
                | SessionError::NotAccepting(_) => ErrorCode::JoinRejected,
                SessionError::PlayerNotFound(_) => ErrorCode::NotInGame,
                SessionError::NotEnoughPlayers { .. } => ErrorCode::NotEnoughPlayers,
                SessionError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            },
            LobbyError::Auth(AuthError::Expired) => ErrorCode::TokenExpired,
            LobbyError::Auth(AuthError::NotConfigured | AuthError::EncodeError(_)) => {
                ErrorCode::InternalError
            }
            LobbyError::Auth(_) => ErrorCode::AuthFailed,
        }
    }
}

/// Phase change requested through the lobby.
#[derive(Debug, Clone, Copy)]
enum PhaseChange {
    Start,
    Pause,
    Resume,
    End,
}

/// Shared server state: sessions, connections, credentials.
pub struct Lobby {
    sessions: SessionRegistry,
    hub: Arc<BroadcastHub>,
    tokens: Arc<TokenRegistry>,
    auth: AuthConfig,
    /// Held from a mutation until its broadcast is queued.
    mutations: Mutex<()>,
}

impl Lobby {
    /// Build a lobby around fresh registries.
    pub fn new(session_config: SessionConfig, auth: AuthConfig) -> Self {
        Self {
            sessions: SessionRegistry::new(session_config),
            hub: Arc::new(BroadcastHub::new()),
            tokens: Arc::new(TokenRegistry::new()),
            auth,
            mutations: Mutex::new(()),
        }
    }

    /// Session registry.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Connection hub.
    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    /// Credential table.
    pub fn token_registry(&self) -> &Arc<TokenRegistry> {
        &self.tokens
    }

    /// Issue a credential, record its expiry and announce the user.
    #[instrument(skip(self))]
    pub async fn login(&self, username: &str) -> Result<IssuedToken, LobbyError> {
        let username = normalize(username)?;
        let issued = issue_token(username, &self.auth)?;
        self.tokens.put(username, issued.expires_at).await;
        info!("Issued credential for {} (expires {})", username, issued.expires_at);

        let announcement = ServerMessage::UserConnected(UserConnected {
            username: username.to_string(),
            expires_at: issued.expires_at,
        });
        self.announce(announcement, username).await;
        Ok(issued)
    }

    /// Tracked credentials, for a caller holding a valid one.
    pub async fn tokens(
        &self,
        bearer: &str,
    ) -> Result<BTreeMap<String, DateTime<Utc>>, LobbyError> {
        let claims = validate_token(bearer, &self.auth)?;
        debug!("Token listing requested by {}", claims.sub);
        Ok(self.tokens.all().await)
    }

    /// Seat a player in the current game. A new game is opened when there
    /// is none or the current one has ended.
    #[instrument(skip(self))]
    pub async fn join(&self, username: &str) -> Result<RosterChange, LobbyError> {
        let username = normalize(username)?;
        let _serialized = self.mutations.lock().await;
        let change = self.sessions.join_current(username).await?;

        let message = ServerMessage::PlayerJoined(GameEvent {
            message: format!("{} joined the game", username),
            game: change.game.clone(),
        });
        self.announce(message, username).await;

        info!("{} joined at position {}", username, change.player.position);
        Ok(change)
    }

    /// Remove a player from the current game.
    #[instrument(skip(self))]
    pub async fn leave(&self, username: &str) -> Result<RosterChange, LobbyError> {
        let username = normalize(username)?;
        let _serialized = self.mutations.lock().await;
        let change = self.current_session().await?.remove_player(username).await?;

        let message = ServerMessage::PlayerLeft(GameEvent {
            message: format!("{} left the game", username),
            game: change.game.clone(),
        });
        self.announce(message, username).await;

        info!("{} left position {}", username, change.player.position);
        Ok(change)
    }

    /// Start the current game.
    pub async fn start(&self, requested_by: &str) -> Result<SessionSnapshot, LobbyError> {
        self.change_phase(requested_by, PhaseChange::Start).await
    }

    /// Pause the current game.
    pub async fn pause(&self, requested_by: &str) -> Result<SessionSnapshot, LobbyError> {
        self.change_phase(requested_by, PhaseChange::Pause).await
    }

    /// Resume the current game.
    pub async fn resume(&self, requested_by: &str) -> Result<SessionSnapshot, LobbyError> {
        self.change_phase(requested_by, PhaseChange::Resume).await
    }

    /// End the current game.
    pub async fn end(&self, requested_by: &str) -> Result<SessionSnapshot, LobbyError> {
        self.change_phase(requested_by, PhaseChange::End).await
    }

    /// Current game and connected users.
    pub async fn state(&self) -> LobbyState {
        let game = match self.sessions.current().await {
            Some(session) => Some(session.snapshot().await),
            None => None,
        };

        LobbyState {
            game,
            connected_users: self.hub.connected_identities().await,
        }
    }

    #[instrument(skip(self))]
    async fn change_phase(
        &self,
        requested_by: &str,
        change: PhaseChange,
    ) -> Result<SessionSnapshot, LobbyError> {
        let requested_by = normalize(requested_by)?;
        let _serialized = self.mutations.lock().await;
        let session = self.current_session().await?;

        let game = match change {
            PhaseChange::Start => session.start().await?,
            PhaseChange::Pause => session.pause().await?,
            PhaseChange::Resume => session.resume().await?,
            PhaseChange::End => session.end().await?,
        };

        let event = |verb: &str| GameEvent {
            message: format!("{} {} the game", requested_by, verb),
            game: game.clone(),
        };
        let message = match change {
            PhaseChange::Start => ServerMessage::GameStarted(GameEvent {
                message: format!(
                    "{} started the game with {} players",
                    requested_by,
                    game.players.len()
                ),
                game: game.clone(),
            }),
            PhaseChange::Pause => ServerMessage::GameUpdate(event("paused")),
            PhaseChange::Resume => ServerMessage::GameUpdate(event("resumed")),
            PhaseChange::End => ServerMessage::GameUpdate(event("ended")),
        };
        self.announce(message, requested_by).await;

        info!("Session {} is now {}", game.id, game.state);
        Ok(game)
    }

    async fn current_session(&self) -> Result<SessionHandle, LobbyError> {
        self.sessions.current().await.ok_or(LobbyError::NoActiveGame)
    }

    async fn announce(&self, message: ServerMessage, from: &str) {
        let delivered = self.hub.broadcast(&Envelope::from_user(message, from)).await;
        debug!("Broadcast from {} reached {} connections", from, delivered);
    }
}

fn normalize(username: &str) -> Result<&str, LobbyError> {
    let trimmed = username.trim();
    if trimmed.is_empty() {
        Err(LobbyError::InvalidUsername)
    } else {
        Ok(trimmed)
    }
}
