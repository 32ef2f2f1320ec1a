//! Game Module
//!
//! Card game roster and phase state.
//!
//! ## Module Structure
//!
//! - `session`: Single game state machine (roster, seats, phase)
//! - `registry`: Session ownership, current game, lock-guarded handles

pub mod session;
pub mod registry;

// Re-export key types
pub use session::{
    GameSession, Player, SessionConfig, SessionError, SessionId, SessionPhase, SessionSnapshot,
};
pub use registry::{RosterChange, SessionHandle, SessionRegistry};
