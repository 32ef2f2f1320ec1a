//! # Katana Lobby Server
//!
//! Real-time lobby for the Katana card game. Players join a shared game,
//! the game moves through its phases, and every change is pushed to all
//! connected viewers over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    KATANA SERVER                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  game/           - Roster and phase state                    │
//! │  ├── session.rs  - Game state machine, seat assignment       │
//! │  └── registry.rs - Session ownership, current game           │
//! │                                                              │
//! │  network/        - Networking                                │
//! │  ├── server.rs   - WebSocket server, heartbeat, dispatch     │
//! │  ├── lobby.rs    - Mutation + broadcast coordinator          │
//! │  ├── hub.rs      - Live connections, fan-out delivery        │
//! │  ├── protocol.rs - Message types                             │
//! │  ├── auth.rs     - JWT issuance and validation               │
//! │  └── tokens.rs   - Issued credential table, expiry sweep     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Consistency
//!
//! Shared state is never handed out by reference:
//! - Each session sits behind its own `RwLock`; readers get copies
//! - Session creation happens under the registry write guard
//! - Broadcasts snapshot recipients, then enqueue without holding the lock
//! - Every successful lobby mutation produces exactly one broadcast

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod game;
pub mod network;

// Re-export commonly used types
pub use game::session::{GameSession, Player, SessionConfig, SessionPhase, SessionSnapshot};
pub use game::registry::SessionRegistry;
pub use network::lobby::Lobby;
pub use network::server::{GameServer, ServerConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Seats per game
pub const MAX_PLAYERS: usize = 7;

/// Default number of seated players required to start
pub const MIN_PLAYERS_TO_START: usize = 3;

/// Starting life for every player
pub const DEFAULT_LIFE: i32 = 4;

/// Starting honor for every player
pub const DEFAULT_HONOR: i32 = 4;
