//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every message is a JSON text frame tagged by `type`, with camelCase
//! names for both the tag and the fields.

use serde::{Serialize, Deserialize};
use serde_json::Value;

use crate::core::grid::Cell;
use crate::game::events::GameEvent;
use crate::game::spell::{Presentation, SpellId};
use crate::game::state::{MatchPhase, UserId};
use crate::game::view::MatchView;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Bind this socket to a roster entry.
    JoinMatch(JoinRequest),

    /// Set or toggle readiness.
    PlayerReady {
        /// Explicit value; toggles when absent.
        #[serde(default)]
        ready: Option<bool>,
    },

    /// Pick a start cell during preparation.
    RequestPositionChange {
        /// Column.
        x: i32,
        /// Row.
        y: i32,
    },

    /// Move during the caller's turn.
    RequestMovement {
        /// Destination column.
        x: i32,
        /// Destination row.
        y: i32,
        /// Path the client already computed, start cell first.
        #[serde(default)]
        path: Option<Vec<Cell>>,
    },

    /// Raise a spell (presentation only).
    RequestSpellPrep(SpellPrepRequest),

    /// Lower the raised spell.
    RequestSpellPrepCancel {},

    /// Cast a spell.
    RequestSpellCast(SpellCastRequest),

    /// Pass the turn.
    EndTurn {},

    /// Face a direction.
    UpdateOrientation {
        /// Radians.
        orientation: f64,
    },

    /// Latency probe.
    Ping {
        /// Client clock, echoed back.
        timestamp: u64,
    },
}

/// `joinMatch` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    /// Room to join.
    pub match_id: String,
    /// Join token (JWT).
    pub token: String,
}

/// `requestSpellPrep` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpellPrepRequest {
    /// Spell being raised.
    pub spell_id: SpellId,
}

/// `requestSpellCast` payload. Either a single `targetX`/`targetY` pair or a
/// `targets` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpellCastRequest {
    /// Spell to cast.
    pub spell_id: SpellId,
    /// Single target column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_x: Option<i32>,
    /// Single target row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_y: Option<i32>,
    /// Multiple targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<Vec<Cell>>,
}

impl SpellCastRequest {
    /// Targets in submission order. A `targets` list wins over the single
    /// pair; a half-specified pair yields nothing.
    pub fn target_cells(&self) -> Vec<Cell> {
        if let Some(ref targets) = self.targets {
            return targets.clone();
        }
        match (self.target_x, self.target_y) {
            (Some(x), Some(y)) => vec![Cell::new(x, y)],
            _ => Vec::new(),
        }
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Join accepted.
    Joined(JoinedInfo),

    /// Join or protocol failure. Gameplay rejections never produce this.
    Error(ServerError),

    /// Reply to `ping`.
    Pong(PongInfo),

    /// Server is going away.
    Shutdown {
        /// Human readable reason.
        reason: String,
    },

    /// Filtered match snapshot.
    GameState(GameStateMessage),

    /// Phase transition.
    PhaseChanged {
        /// New phase.
        phase: MatchPhase,
    },

    /// A player raised a spell.
    SpellPrep(SpellPrepBroadcast),

    /// A player lowered their spell.
    SpellPrepCancel(UserRef),

    /// A spell resolved.
    SpellCast(SpellCastBroadcast),

    /// Delayed hit notification.
    SpellHit(SpellHitBroadcast),

    /// Delayed teleport landed.
    TeleportConfirm(TeleportBroadcast),
}

/// `joined` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedInfo {
    /// Room joined.
    pub match_id: String,
    /// Identity bound to the socket.
    pub user_id: UserId,
}

/// `pong` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongInfo {
    /// Client timestamp from the ping.
    pub timestamp: u64,
    /// Server wall clock, Unix millis.
    pub server_time: u64,
}

/// `gameState` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStateMessage {
    /// What this viewer may see.
    pub state: MatchView,
    /// Hex SHA-256 of `state`.
    pub state_hash: String,
}

impl GameStateMessage {
    /// Wrap a view together with its digest.
    pub fn new(state: MatchView) -> Result<Self, serde_json::Error> {
        let state_hash = state.digest()?;
        Ok(Self { state, state_hash })
    }
}

/// A bare user reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    /// The player.
    pub user_id: UserId,
}

/// `spellPrep` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpellPrepBroadcast {
    /// Caster.
    pub user_id: UserId,
    /// Spell raised.
    pub spell_id: SpellId,
    /// Animation definition from the catalog.
    pub prep_anim_def: Value,
}

/// `spellCast` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpellCastBroadcast {
    /// Caster.
    pub user_id: UserId,
    /// Spell cast.
    pub spell_id: SpellId,
    /// Set when the cast had exactly one target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_x: Option<i32>,
    /// Set when the cast had exactly one target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_y: Option<i32>,
    /// All targets.
    pub targets: Vec<Cell>,
    /// Animation definition from the catalog.
    pub cast_anim_def: Value,
    /// Full presentation block.
    pub presentation: Presentation,
}

/// `spellHit` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpellHitBroadcast {
    /// Player hit.
    pub target_user_id: UserId,
    /// Caster.
    pub caster_user_id: UserId,
    /// Spell.
    pub spell_id: SpellId,
}

/// `teleportConfirm` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeleportBroadcast {
    /// Player moved.
    pub user_id: UserId,
    /// Landing column.
    pub destination_x: i32,
    /// Landing row.
    pub destination_y: i32,
}

/// Server error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Error message.
    pub message: String,
}

impl ServerError {
    /// Build an `error` message.
    pub fn message(code: ErrorCode, message: impl Into<String>) -> ServerMessage {
        ServerMessage::Error(ServerError { code, message: message.into() })
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Frame did not parse.
    InvalidMessage,
    /// Gameplay message before `joinMatch`.
    NotJoined,
    /// Socket already bound.
    AlreadyJoined,
    /// Token rejected.
    AuthFailed,
    /// No such room.
    MatchNotFound,
    /// User is not on the room roster.
    NotOnRoster,
    /// Room is shutting down.
    MatchClosed,
    /// Server error.
    InternalError,
}

impl From<GameEvent> for ServerMessage {
    fn from(event: GameEvent) -> Self {
        match event {
            GameEvent::PhaseChanged { phase } => ServerMessage::PhaseChanged { phase },
            GameEvent::SpellPrep { user_id, spell_id, prep_anim } => {
                ServerMessage::SpellPrep(SpellPrepBroadcast { user_id, spell_id, prep_anim_def: prep_anim })
            }
            GameEvent::SpellPrepCancel { user_id } => ServerMessage::SpellPrepCancel(UserRef { user_id }),
            GameEvent::SpellCast { user_id, spell_id, targets, cast_anim, presentation } => {
                let single = match targets.as_slice() {
                    [only] => Some(*only),
                    _ => None,
                };
                ServerMessage::SpellCast(SpellCastBroadcast {
                    user_id,
                    spell_id,
                    target_x: single.map(|c| c.x),
                    target_y: single.map(|c| c.y),
                    targets,
                    cast_anim_def: cast_anim,
                    presentation,
                })
            }
            GameEvent::SpellHit { target_user_id, caster_user_id, spell_id } => {
                ServerMessage::SpellHit(SpellHitBroadcast { target_user_id, caster_user_id, spell_id })
            }
            GameEvent::TeleportConfirm { user_id, destination } => ServerMessage::TeleportConfirm(TeleportBroadcast {
                user_id,
                destination_x: destination.x,
                destination_y: destination.y,
            }),
        }
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// `pong` stamped with the current wall clock.
    pub fn pong(timestamp: u64) -> Self {
        ServerMessage::Pong(PongInfo {
            timestamp,
            server_time: chrono::Utc::now().timestamp_millis().max(0) as u64,
        })
    }
}
