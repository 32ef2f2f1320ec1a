//! Game Session State
//!
//! Roster and phase of a single card game. Pure state machine: no locks,
//! no I/O. Concurrency is layered on top by `game::registry`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DEFAULT_HONOR, DEFAULT_LIFE, MAX_PLAYERS, MIN_PLAYERS_TO_START};

// =============================================================================
// SESSION ID
// =============================================================================

/// Unique session identifier (UUID v4).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    /// Generate a fresh random id.
    pub fn new_v4() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// PHASE
// =============================================================================

/// Game phase.
///
/// `Waiting -> Started <-> Paused`, and `Started | Paused -> Ended`.
/// Nothing ever returns to `Waiting`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPhase {
    /// Lobby is open, players may join.
    Waiting,
    /// Game in progress.
    Started,
    /// Game suspended.
    Paused,
    /// Game over. Terminal.
    Ended,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionPhase::Waiting => "WAITING",
            SessionPhase::Started => "STARTED",
            SessionPhase::Paused => "PAUSED",
            SessionPhase::Ended => "ENDED",
        };
        f.write_str(name)
    }
}

// =============================================================================
// PLAYER
// =============================================================================

/// A seated player.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    /// Display name, unique within a session.
    pub name: String,
    /// Seat number in `1..=max_players`. Assigned on join.
    pub position: u8,
    /// Life counter.
    pub life: i32,
    /// Honor counter.
    pub honor: i32,
    /// When the player joined.
    pub joined_at: DateTime<Utc>,
}

impl Player {
    /// New player with default resources and no seat yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            position: 0,
            life: DEFAULT_LIFE,
            honor: DEFAULT_HONOR,
            joined_at: Utc::now(),
        }
    }
}

// =============================================================================
// CONFIG & ERRORS
// =============================================================================

/// Roster limits for a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Seat capacity.
    pub max_players: usize,
    /// Players required before `start` succeeds.
    pub min_players: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_players: MAX_PLAYERS,
            min_players: MIN_PLAYERS_TO_START,
        }
    }
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Every seat is taken.
    #[error("Session is full")]
    SessionFull,

    /// A player with this name is already seated.
    #[error("Player {0} already in session")]
    AlreadyInSession(String),

    /// Joins are only accepted while waiting.
    #[error("Session is not accepting players (phase {0})")]
    NotAccepting(SessionPhase),

    /// No player with this name.
    #[error("Player {0} not found")]
    PlayerNotFound(String),

    /// Too few players to start.
    #[error("Not enough players: {current} seated, {required} required")]
    NotEnoughPlayers {
        /// Players currently seated.
        current: usize,
        /// Configured minimum.
        required: usize,
    },

    /// Phase change not allowed from the current phase.
    #[error("Cannot move from {from} to {to}")]
    InvalidTransition {
        /// Phase at the time of the request.
        from: SessionPhase,
        /// Requested phase.
        to: SessionPhase,
    },
}

// =============================================================================
// GAME SESSION
// =============================================================================

/// Serializable point-in-time copy of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Session identifier.
    pub id: SessionId,
    /// Phase at snapshot time.
    pub state: SessionPhase,
    /// Roster keyed by name.
    pub players: BTreeMap<String, Player>,
    /// Who created the session.
    pub created_by: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Seat capacity.
    pub max_players: usize,
}

/// One card game.
#[derive(Clone, Debug)]
pub struct GameSession {
    id: SessionId,
    phase: SessionPhase,
    players: BTreeMap<String, Player>,
    created_by: String,
    created_at: DateTime<Utc>,
    config: SessionConfig,
}

impl GameSession {
    /// Create a waiting session owned by `created_by`.
    pub fn new(created_by: impl Into<String>, config: SessionConfig) -> Self {
        Self {
            id: SessionId::new_v4(),
            phase: SessionPhase::Waiting,
            players: BTreeMap::new(),
            created_by: created_by.into(),
            created_at: Utc::now(),
            config,
        }
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Creator identity.
    pub fn created_by(&self) -> &str {
        &self.created_by
    }

    /// Roster limits.
    pub fn config(&self) -> SessionConfig {
        self.config
    }

    /// Number of seated players.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Look up a single player.
    pub fn player(&self, name: &str) -> Option<&Player> {
        self.players.get(name)
    }

    /// Seat a player at the lowest free position.
    ///
    /// Returns a copy of the seated player. On error the roster is untouched.
    pub fn add_player(&mut self, mut player: Player) -> Result<Player, SessionError> {
        if self.phase != SessionPhase::Waiting {
            return Err(SessionError::NotAccepting(self.phase));
        }

        if self.players.len() >= self.config.max_players {
            return Err(SessionError::SessionFull);
        }

        if self.players.contains_key(&player.name) {
            return Err(SessionError::AlreadyInSession(player.name));
        }

        player.position = self.next_position().ok_or(SessionError::SessionFull)?;
        self.players.insert(player.name.clone(), player.clone());
        Ok(player)
    }

    /// Remove a player. Other seats keep their positions.
    pub fn remove_player(&mut self, name: &str) -> Result<Player, SessionError> {
        self.players
            .remove(name)
            .ok_or_else(|| SessionError::PlayerNotFound(name.to_string()))
    }

    /// Defensive copy of the roster.
    pub fn players(&self) -> BTreeMap<String, Player> {
        self.players.clone()
    }

    /// Start the game.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.phase != SessionPhase::Waiting {
            return Err(SessionError::InvalidTransition {
                from: self.phase,
                to: SessionPhase::Started,
            });
        }

        if self.players.len() < self.config.min_players {
            return Err(SessionError::NotEnoughPlayers {
                current: self.players.len(),
                required: self.config.min_players,
            });
        }

        self.phase = SessionPhase::Started;
        Ok(())
    }

    /// Suspend a running game.
    pub fn pause(&mut self) -> Result<(), SessionError> {
        self.transition(&[SessionPhase::Started], SessionPhase::Paused)
    }

    /// Resume a paused game.
    pub fn resume(&mut self) -> Result<(), SessionError> {
        self.transition(&[SessionPhase::Paused], SessionPhase::Started)
    }

    /// Finish the game.
    pub fn end(&mut self) -> Result<(), SessionError> {
        self.transition(&[SessionPhase::Started, SessionPhase::Paused], SessionPhase::Ended)
    }

    /// Serializable copy of the whole session.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            state: self.phase,
            players: self.players.clone(),
            created_by: self.created_by.clone(),
            created_at: self.created_at,
            max_players: self.config.max_players,
        }
    }

    fn transition(
        &mut self,
        allowed: &[SessionPhase],
        to: SessionPhase,
    ) -> Result<(), SessionError> {
        if !allowed.contains(&self.phase) {
            return Err(SessionError::InvalidTransition { from: self.phase, to });
        }
        self.phase = to;
        Ok(())
    }

    /// First-fit scan over `1..=max_players`.
    fn next_position(&self) -> Option<u8> {
        let used: BTreeSet<u8> = self.players.values().map(|p| p.position).collect();
        (1..=self.config.max_players)
            .filter_map(|seat| u8::try_from(seat).ok())
            .find(|seat| !used.contains(seat))
    }
}

// =============================================================================
// TESTS
// =============================================================================
