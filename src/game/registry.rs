//! Session Registry
//!
//! Owns every session created during the process lifetime and tracks the
//! current one. Each session sits behind its own `RwLock`; callers only ever
//! see copies, never a guard.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::game::session::{
    GameSession, Player, SessionConfig, SessionError, SessionId, SessionPhase, SessionSnapshot,
};

// =============================================================================
// SESSION HANDLE
// =============================================================================

/// A seat taken or given up, with the session exactly as the change left it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RosterChange {
    /// The player who joined or left.
    pub player: Player,
    /// Session right after the change.
    pub game: SessionSnapshot,
}

/// Shared, lock-guarded reference to a session.
///
/// Reads take the shared guard and copy before releasing it. Writes hold the
/// exclusive guard for the mutation and the snapshot of its result.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    id: SessionId,
    inner: Arc<RwLock<GameSession>>,
}

impl SessionHandle {
    fn new(session: GameSession) -> Self {
        Self {
            id: session.id(),
            inner: Arc::new(RwLock::new(session)),
        }
    }

    /// Session id. Never changes, so no lock is taken.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Seat a player.
    pub async fn add_player(&self, player: Player) -> Result<RosterChange, SessionError> {
        let mut session = self.inner.write().await;
        let player = session.add_player(player)?;
        Ok(RosterChange {
            player,
            game: session.snapshot(),
        })
    }

    /// Remove a player by name.
    pub async fn remove_player(&self, name: &str) -> Result<RosterChange, SessionError> {
        let mut session = self.inner.write().await;
        let player = session.remove_player(name)?;
        Ok(RosterChange {
            player,
            game: session.snapshot(),
        })
    }

    /// Roster copy.
    pub async fn players(&self) -> BTreeMap<String, Player> {
        self.inner.read().await.players()
    }

    /// Current phase.
    pub async fn phase(&self) -> SessionPhase {
        self.inner.read().await.phase()
    }

    /// Start the game.
    pub async fn start(&self) -> Result<SessionSnapshot, SessionError> {
        self.mutate(GameSession::start).await
    }

    /// Pause the game.
    pub async fn pause(&self) -> Result<SessionSnapshot, SessionError> {
        self.mutate(GameSession::pause).await
    }

    /// Resume the game.
    pub async fn resume(&self) -> Result<SessionSnapshot, SessionError> {
        self.mutate(GameSession::resume).await
    }

    /// End the game.
    pub async fn end(&self) -> Result<SessionSnapshot, SessionError> {
        self.mutate(GameSession::end).await
    }

    /// Full copy of the session.
    pub async fn snapshot(&self) -> SessionSnapshot {
        self.inner.read().await.snapshot()
    }

    async fn mutate(
        &self,
        op: fn(&mut GameSession) -> Result<(), SessionError>,
    ) -> Result<SessionSnapshot, SessionError> {
        let mut session = self.inner.write().await;
        op(&mut *session)?;
        Ok(session.snapshot())
    }
}

// =============================================================================
// SESSION REGISTRY
// =============================================================================

#[derive(Default)]
struct RegistryInner {
    sessions: BTreeMap<SessionId, SessionHandle>,
    current: Option<SessionId>,
}

impl RegistryInner {
    fn insert_current(&mut self, created_by: &str, config: SessionConfig) -> SessionHandle {
        let handle = SessionHandle::new(GameSession::new(created_by, config));
        self.sessions.insert(handle.id(), handle.clone());
        self.current = Some(handle.id());
        info!("Created session {} for {}", handle.id(), created_by);
        handle
    }

    fn current(&self) -> Option<SessionHandle> {
        self.current.and_then(|id| self.sessions.get(&id).cloned())
    }
}

/// Registry of sessions with a single "current" one.
pub struct SessionRegistry {
    config: SessionConfig,
    inner: RwLock<RegistryInner>,
}

impl SessionRegistry {
    /// Create an empty registry. Every session it creates uses `config`.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Roster limits applied to new sessions.
    pub fn config(&self) -> SessionConfig {
        self.config
    }

    /// Create a new session and make it current.
    pub async fn create_session(&self, created_by: &str) -> SessionHandle {
        self.inner.write().await.insert_current(created_by, self.config)
    }

    /// Return the current session, creating it if none exists or the
    /// current one has ended.
    ///
    /// The check and the creation share one write guard, so racing callers
    /// always end up with the same session. Lock order is registry, then
    /// session.
    pub async fn get_or_create_current(&self, created_by: &str) -> SessionHandle {
        let mut inner = self.inner.write().await;
        if let Some(handle) = inner.current() {
            if handle.phase().await != SessionPhase::Ended {
                return handle;
            }
            debug!("Session {} has ended, opening a new one", handle.id());
        }

        inner.insert_current(created_by, self.config)
    }

    /// Seat `player_name` in the current session, creating the session
    /// (owned by that player) if needed.
    pub async fn join_current(&self, player_name: &str) -> Result<RosterChange, SessionError> {
        // Registry guard is released before the seat is taken
        let session = self.get_or_create_current(player_name).await;
        let change = session.add_player(Player::new(player_name)).await?;
        debug!(
            "{} seated at position {} in {}",
            change.player.name,
            change.player.position,
            session.id()
        );
        Ok(change)
    }

    /// The current session, if any. An ended session stays current until
    /// the next join replaces it.
    pub async fn current(&self) -> Option<SessionHandle> {
        self.inner.read().await.current()
    }

    /// Look up a session by id.
    pub async fn get(&self, id: &SessionId) -> Option<SessionHandle> {
        self.inner.read().await.sessions.get(id).cloned()
    }

    /// Number of sessions created so far.
    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}
