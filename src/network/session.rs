//! Match Sessions
//!
//! One tokio task per match. The task owns the `MatchEngine` and drains a
//! bounded mailbox, so handlers for a match run one at a time in arrival
//! order while different matches run concurrently. Deferred actions are
//! sleep tasks that post back into the same mailbox.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn, error};

use crate::core::grid::Cell;
use crate::game::engine::{MatchEngine, Outcome, Rejection};
use crate::game::events::{DeferredAction, GameEvent, Scheduled, ValidityToken};
use crate::game::state::{CharacterProfile, Team, UserId};
use crate::game::view::{event_visible_to, MatchView};
use crate::network::protocol::{ClientMessage, GameStateMessage, ServerMessage};
use crate::network::roster::{lookup_character, CharacterDirectory};

/// Identifies one socket, so a stale detach cannot drop a newer rejoin.
pub type ConnectionId = u64;

/// Mailbox capacity per match.
pub const MAILBOX_CAPACITY: usize = 256;

/// Upper bound on one character-service call.
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// COMMANDS
// =============================================================================

/// Everything a match task reacts to.
#[derive(Debug)]
pub enum MatchCommand {
    /// Inbound gameplay message from a joined socket.
    Client {
        /// Sender identity.
        user_id: UserId,
        /// Message.
        message: ClientMessage,
    },
    /// A socket joined (or rejoined) as `user_id`.
    Attach {
        /// Player.
        user_id: UserId,
        /// Socket id.
        connection: ConnectionId,
        /// Outbound queue for the socket.
        sender: mpsc::Sender<ServerMessage>,
    },
    /// A socket went away.
    Detach {
        /// Player.
        user_id: UserId,
        /// Socket id.
        connection: ConnectionId,
    },
    /// A rejoin profile lookup finished.
    Profile {
        /// Player.
        user_id: UserId,
        /// Fetched profile; `None` on failure or timeout.
        profile: Option<CharacterProfile>,
    },
    /// A scheduled action came due.
    Deferred {
        /// Action.
        action: DeferredAction,
        /// Stamp taken when scheduled.
        token: ValidityToken,
    },
    /// External end-of-game call.
    EndGame {
        /// Winning side.
        winner: Team,
    },
    /// Close the match now.
    Shutdown {
        /// Sent to every socket.
        reason: String,
    },
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// No open match with this id.
    #[error("match {0} not found")]
    MatchNotFound(String),
    /// A match with this id is already open.
    #[error("match {0} already exists")]
    DuplicateMatch(String),
    /// User is not on the roster.
    #[error("user {0} is not on the roster")]
    NotOnRoster(UserId),
    /// User belongs to another open match.
    #[error("user {user_id} is already in match {match_id}")]
    AlreadyInMatch {
        /// User.
        user_id: UserId,
        /// Their current match.
        match_id: String,
    },
    /// The match task has stopped.
    #[error("match {0} is closed")]
    MatchClosed(String),
}

// =============================================================================
// HANDLE
// =============================================================================

/// Cheap, cloneable address of a running match.
#[derive(Clone, Debug)]
pub struct MatchHandle {
    match_id: String,
    roster: Arc<BTreeSet<UserId>>,
    mailbox: mpsc::Sender<MatchCommand>,
}

impl MatchHandle {
    /// Match id.
    pub fn match_id(&self) -> &str {
        &self.match_id
    }

    /// Whether `user_id` is on the roster.
    pub fn has_player(&self, user_id: &str) -> bool {
        self.roster.contains(user_id)
    }

    /// Post a command.
    pub async fn send(&self, command: MatchCommand) -> Result<(), SessionError> {
        self.mailbox
            .send(command)
            .await
            .map_err(|_| SessionError::MatchClosed(self.match_id.clone()))
    }

    /// The match task has stopped.
    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }
}

// =============================================================================
// MATCH SESSION
// =============================================================================

struct Connection {
    id: ConnectionId,
    sender: mpsc::Sender<ServerMessage>,
}

/// State owned by a match task.
pub struct MatchSession {
    engine: MatchEngine,
    connections: BTreeMap<UserId, Connection>,
    mailbox: mpsc::Sender<MatchCommand>,
    directory: Arc<dyn CharacterDirectory>,
}

enum Flow {
    Continue,
    Stop,
}

impl MatchSession {
    fn match_id(&self) -> &str {
        &self.engine.state().match_id
    }

    /// Drain the mailbox until the match is disposed or shut down.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<MatchCommand>) {
        info!(match_id = %self.match_id(), "match session started");
        while let Some(command) = inbox.recv().await {
            if let Flow::Stop = self.handle_command(command) {
                break;
            }
        }
        inbox.close();
        info!(match_id = %self.match_id(), "match session closed");
    }

    fn handle_command(&mut self, command: MatchCommand) -> Flow {
        match command {
            MatchCommand::Client { user_id, message } => {
                let Some(result) = dispatch(&mut self.engine, &user_id, message) else {
                    return Flow::Continue;
                };
                self.finish(Some(&user_id), result)
            }
            MatchCommand::Attach { user_id, connection, sender } => {
                self.attach(user_id, connection, sender);
                Flow::Continue
            }
            MatchCommand::Profile { user_id, profile } => {
                // a failed lookup keeps the old profile
                let Some(profile) = profile else {
                    return Flow::Continue;
                };
                let unchanged = self
                    .engine
                    .state()
                    .player(&user_id)
                    .is_some_and(|p| p.character.as_ref() == Some(&profile));
                if !unchanged {
                    self.engine.set_character(&user_id, Some(profile));
                    self.broadcast_state();
                }
                Flow::Continue
            }
            MatchCommand::Detach { user_id, connection } => {
                if self.connections.get(&user_id).map(|c| c.id) == Some(connection) {
                    self.connections.remove(&user_id);
                    self.engine.set_connected(&user_id, false);
                    debug!(match_id = %self.match_id(), user = %user_id, "player detached");
                }
                Flow::Continue
            }
            MatchCommand::Deferred { action, token } => {
                let result = self.engine.apply_deferred(action, token);
                self.finish(None, result)
            }
            MatchCommand::EndGame { winner } => {
                let result = self.engine.end_game(winner);
                self.finish(None, result)
            }
            MatchCommand::Shutdown { reason } => {
                self.broadcast(&ServerMessage::Shutdown { reason });
                Flow::Stop
            }
        }
    }

    fn attach(&mut self, user_id: UserId, connection: ConnectionId, sender: mpsc::Sender<ServerMessage>) {
        let character_id = match self.engine.state().player(&user_id) {
            Some(p) => p.character_id.clone(),
            None => {
                warn!(match_id = %self.match_id(), user = %user_id, "attach for unknown player");
                return;
            }
        };

        self.engine.set_connected(&user_id, true);
        let replaced = self.connections.insert(user_id.clone(), Connection { id: connection, sender });
        info!(
            match_id = %self.match_id(),
            user = %user_id,
            rejoin = replaced.is_some(),
            "player attached"
        );
        self.send_state(&user_id);
        self.refresh_profile(user_id, character_id);
    }

    /// Fetch the profile off the match task and post it back.
    fn refresh_profile(&self, user_id: UserId, character_id: String) {
        let directory = Arc::clone(&self.directory);
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let profile = bounded_lookup(directory.as_ref(), &user_id, &character_id).await;
            let _ = mailbox.send(MatchCommand::Profile { user_id, profile }).await;
        });
    }

    fn finish(&mut self, user_id: Option<&str>, result: Result<Outcome, Rejection>) -> Flow {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(rejection) => {
                debug!(match_id = %self.match_id(), user = ?user_id, reason = %rejection, "rejected");
                return Flow::Continue;
            }
        };

        for event in outcome.events {
            self.broadcast_event(event);
        }
        if outcome.state_changed {
            self.broadcast_state();
        }
        for scheduled in outcome.deferred {
            self.schedule(scheduled);
        }
        if outcome.dispose {
            info!(match_id = %self.match_id(), "match disposed");
            return Flow::Stop;
        }
        Flow::Continue
    }

    fn schedule(&self, scheduled: Scheduled) {
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(scheduled.delay_ms)).await;
            // mailbox closed means the match is gone
            let _ = mailbox
                .send(MatchCommand::Deferred { action: scheduled.action, token: scheduled.token })
                .await;
        });
    }

    fn broadcast(&self, message: &ServerMessage) {
        for (user_id, connection) in &self.connections {
            deliver(user_id, connection, message.clone());
        }
    }

    /// Send an event to every session allowed to see it.
    fn broadcast_event(&self, event: GameEvent) {
        let state = self.engine.state();
        let audience: Vec<&UserId> = self
            .connections
            .keys()
            .filter(|user_id| event_visible_to(state, &event, state.team_of(user_id)))
            .collect();
        let message = ServerMessage::from(event);
        for user_id in audience {
            if let Some(connection) = self.connections.get(user_id) {
                deliver(user_id, connection, message.clone());
            }
        }
    }

    fn broadcast_state(&self) {
        for user_id in self.connections.keys() {
            self.send_state(user_id);
        }
    }

    fn send_state(&self, user_id: &str) {
        let Some(connection) = self.connections.get(user_id) else {
            return;
        };
        let state = self.engine.state();
        let view = MatchView::build(state, state.team_of(user_id));
        match GameStateMessage::new(view) {
            Ok(message) => deliver(user_id, connection, ServerMessage::GameState(message)),
            Err(e) => error!(match_id = %state.match_id, user = %user_id, error = %e, "failed to serialize state"),
        }
    }
}

/// Character lookup capped at [`LOOKUP_TIMEOUT`].
async fn bounded_lookup(
    directory: &dyn CharacterDirectory,
    user_id: &str,
    character_id: &str,
) -> Option<CharacterProfile> {
    match tokio::time::timeout(LOOKUP_TIMEOUT, lookup_character(directory, user_id, character_id)).await {
        Ok(profile) => profile,
        Err(_) => {
            warn!(user = %user_id, character = %character_id, "character lookup timed out");
            None
        }
    }
}

fn deliver(user_id: &str, connection: &Connection, message: ServerMessage) {
    if let Err(e) = connection.sender.try_send(message) {
        debug!(user = %user_id, error = %e, "dropping outbound message");
    }
}

/// Route a gameplay message to its handler. Join and ping never reach a
/// match.
fn dispatch(engine: &mut MatchEngine, user_id: &str, message: ClientMessage) -> Option<Result<Outcome, Rejection>> {
    let result = match message {
        ClientMessage::PlayerReady { ready } => engine.set_ready(user_id, ready),
        ClientMessage::RequestPositionChange { x, y } => engine.choose_start_position(user_id, Cell::new(x, y)),
        ClientMessage::RequestMovement { x, y, path } => engine.request_movement(user_id, Cell::new(x, y), path),
        ClientMessage::RequestSpellPrep(req) => engine.prepare_spell(user_id, &req.spell_id),
        ClientMessage::RequestSpellPrepCancel {} => engine.cancel_spell_prep(user_id),
        ClientMessage::RequestSpellCast(req) => {
            let targets = req.target_cells();
            engine.cast_spell(user_id, &req.spell_id, targets)
        }
        ClientMessage::EndTurn {} => engine.end_turn(user_id),
        ClientMessage::UpdateOrientation { orientation } => engine.update_orientation(user_id, orientation),
        ClientMessage::JoinMatch(_) | ClientMessage::Ping { .. } => return None,
    };
    Some(result)
}

// =============================================================================
// SESSION MANAGER
// =============================================================================

/// Registry of running matches.
#[derive(Clone, Default)]
pub struct SessionManager {
    matches: Arc<RwLock<BTreeMap<String, MatchHandle>>>,
    players: Arc<RwLock<BTreeMap<UserId, String>>>,
}

impl SessionManager {
    /// Create new session manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up character profiles, then start the match task.
    pub async fn open_match(
        &self,
        mut engine: MatchEngine,
        directory: Arc<dyn CharacterDirectory>,
    ) -> Result<MatchHandle, SessionError> {
        let match_id = engine.state().match_id.clone();
        if self.matches.read().await.contains_key(&match_id) {
            return Err(SessionError::DuplicateMatch(match_id));
        }

        let lookups: Vec<(UserId, String)> = engine
            .state()
            .players
            .values()
            .map(|p| (p.user_id.clone(), p.character_id.clone()))
            .collect();
        for (user_id, character_id) in lookups {
            let profile = bounded_lookup(directory.as_ref(), &user_id, &character_id).await;
            engine.set_character(&user_id, profile);
        }

        let (mailbox, inbox) = mpsc::channel(MAILBOX_CAPACITY);
        let handle = MatchHandle {
            match_id: match_id.clone(),
            roster: Arc::new(engine.state().players.keys().cloned().collect()),
            mailbox: mailbox.clone(),
        };

        {
            let mut matches = self.matches.write().await;
            if matches.contains_key(&match_id) {
                return Err(SessionError::DuplicateMatch(match_id));
            }
            matches.insert(match_id.clone(), handle.clone());
        }
        {
            let mut players = self.players.write().await;
            for user_id in handle.roster.iter() {
                players.insert(user_id.clone(), match_id.clone());
            }
        }

        let session = MatchSession { engine, connections: BTreeMap::new(), mailbox, directory };
        let matches = self.matches.clone();
        let players = self.players.clone();
        tokio::spawn(async move {
            session.run(inbox).await;
            matches.write().await.remove(&match_id);
            players.write().await.retain(|_, m| m != &match_id);
        });

        Ok(handle)
    }

    /// Get a match by id.
    pub async fn get(&self, match_id: &str) -> Option<MatchHandle> {
        self.matches.read().await.get(match_id).cloned()
    }

    /// Match a user is rostered in.
    pub async fn match_of(&self, user_id: &str) -> Option<String> {
        self.players.read().await.get(user_id).cloned()
    }

    /// Attach a socket to a match after authentication.
    pub async fn join(
        &self,
        match_id: &str,
        user_id: &str,
        connection: ConnectionId,
        sender: mpsc::Sender<ServerMessage>,
    ) -> Result<MatchHandle, SessionError> {
        let handle = self
            .get(match_id)
            .await
            .ok_or_else(|| SessionError::MatchNotFound(match_id.to_string()))?;
        if !handle.has_player(user_id) {
            return Err(SessionError::NotOnRoster(user_id.to_string()));
        }
        if let Some(current) = self.match_of(user_id).await {
            if current != match_id {
                return Err(SessionError::AlreadyInMatch { user_id: user_id.to_string(), match_id: current });
            }
        }

        handle
            .send(MatchCommand::Attach { user_id: user_id.to_string(), connection, sender })
            .await?;
        Ok(handle)
    }

    /// Declare the winner of a match.
    pub async fn end_game(&self, match_id: &str, winner: Team) -> Result<(), SessionError> {
        let handle = self
            .get(match_id)
            .await
            .ok_or_else(|| SessionError::MatchNotFound(match_id.to_string()))?;
        handle.send(MatchCommand::EndGame { winner }).await
    }

    /// Stop every match.
    pub async fn shutdown_all(&self, reason: &str) {
        let handles: Vec<MatchHandle> = self.matches.read().await.values().cloned().collect();
        for handle in handles {
            let _ = handle.send(MatchCommand::Shutdown { reason: reason.to_string() }).await;
        }
    }

    /// Get active match count.
    pub async fn match_count(&self) -> usize {
        self.matches.read().await.len()
    }
}

// =============================================================================
// TESTS
// =============================================================================
