//! Network Layer
//!
//! WebSocket server, connection fan-out, and credentials.
//! All roster and phase changes go through `lobby`.

pub mod auth;
pub mod hub;
pub mod lobby;
pub mod protocol;
pub mod server;
pub mod tokens;

pub use auth::{AuthConfig, TokenClaims, AuthError, IssuedToken, issue_token, validate_token};
pub use hub::{BroadcastHub, ConnectionId, Outbound};
pub use lobby::{Lobby, LobbyError};
pub use protocol::{
    ClientMessage, ServerMessage, Envelope, GameEvent, AuthResult, ErrorCode, LobbyState,
};
pub use server::{GameServer, ServerConfig, GameServerError};
pub use tokens::{TokenRegistry, SweeperHandle};
