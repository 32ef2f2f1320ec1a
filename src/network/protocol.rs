//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every frame is a JSON envelope `{"type": ..., "data": {...}, "from": ...}`.

use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::game::session::SessionSnapshot;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
///
/// Unknown `type` values and missing fields fail to parse and are answered
/// with an `error` frame to the sender only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bind an identity to this connection and request a credential.
    Auth(UserPayload),

    /// Take a seat in the current game.
    JoinGame(UserPayload),

    /// Give up a seat.
    LeaveGame(UserPayload),

    /// Start the current game.
    StartGame(UserPayload),

    /// Pause a running game.
    PauseGame(UserPayload),

    /// Resume a paused game.
    ResumeGame(UserPayload),

    /// Finish the game.
    EndGame(UserPayload),

    /// Ask for the current game and connected users. Carries no `data`.
    GetState,

    /// Ask for the credential table.
    ListTokens(TokenRequest),
}

/// Payload shared by every inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPayload {
    /// Acting user.
    pub username: String,
}

/// Payload of `list_tokens`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRequest {
    /// Credential issued by `auth`.
    pub token: String,
}

impl ClientMessage {
    /// Acting user named in the payload, for messages that carry one.
    pub fn username(&self) -> Option<&str> {
        match self {
            ClientMessage::Auth(p)
            | ClientMessage::JoinGame(p)
            | ClientMessage::LeaveGame(p)
            | ClientMessage::StartGame(p)
            | ClientMessage::PauseGame(p)
            | ClientMessage::ResumeGame(p)
            | ClientMessage::EndGame(p) => Some(&p.username),
            ClientMessage::GetState | ClientMessage::ListTokens(_) => None,
        }
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to `auth`. Direct.
    AuthResult(AuthResult),

    /// Someone obtained a credential. Broadcast.
    UserConnected(UserConnected),

    /// Reply to `get_state`. Direct.
    State(LobbyState),

    /// Reply to `list_tokens`. Direct.
    Tokens(TokenList),

    /// A player took a seat. Broadcast.
    PlayerJoined(GameEvent),

    /// A player left. Broadcast.
    PlayerLeft(GameEvent),

    /// The game started. Broadcast.
    GameStarted(GameEvent),

    /// Any other phase change. Broadcast.
    GameUpdate(GameEvent),

    /// Request failed. Direct.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown {
        /// Why.
        reason: String,
    },
}

/// Authentication result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResult {
    /// Whether a credential was issued.
    pub success: bool,
    /// Identity now bound to the connection.
    pub username: String,
    /// Signed credential.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Credential expiry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Why issuance failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Server version.
    pub server_version: String,
}

/// Announcement of a successful `auth`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConnected {
    /// Who logged in.
    pub username: String,
    /// When their credential expires.
    pub expires_at: DateTime<Utc>,
}

/// What a viewer needs to render the lobby.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyState {
    /// Current game, if one exists.
    pub game: Option<SessionSnapshot>,
    /// Identities bound to live connections.
    pub connected_users: Vec<String>,
}

/// Tracked credentials: identity to expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenList {
    /// Expiry per identity.
    pub tokens: BTreeMap<String, DateTime<Utc>>,
}

/// Roster or phase change, with the resulting state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameEvent {
    /// Human-readable description.
    pub message: String,
    /// Full session after the change.
    pub game: SessionSnapshot,
}

/// Server error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Frame could not be parsed.
    InvalidMessage,
    /// Username empty or blank.
    InvalidUsername,
    /// Seat request refused (full, duplicate, game running).
    JoinRejected,
    /// Named player is not seated.
    NotInGame,
    /// No game exists yet.
    NoActiveGame,
    /// Too few players to start.
    NotEnoughPlayers,
    /// Phase change not allowed now.
    InvalidTransition,
    /// Credential rejected.
    AuthFailed,
    /// Credential expired.
    TokenExpired,
    /// Internal error.
    InternalError,
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// Outbound frame: a server message plus the identity it originated from.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    /// `type` and `data`.
    #[serde(flatten)]
    pub message: ServerMessage,
    /// Originating identity, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl Envelope {
    /// Server-authored frame with no originator.
    pub fn new(message: ServerMessage) -> Self {
        Self { message, from: None }
    }

    /// Frame attributed to `from`.
    pub fn from_user(message: ServerMessage, from: impl Into<String>) -> Self {
        Self {
            message,
            from: Some(from.into()),
        }
    }

    /// Error frame.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ServerMessage::Error(ServerError {
            code,
            message: message.into(),
        }))
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Deserialize the `type`/`data` part of a frame.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
