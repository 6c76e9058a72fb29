//! Match Events
//!
//! What the engine hands back to the session after a handler runs:
//! broadcasts to send right away, and deferred actions to fire later.

use serde::{Serialize, Deserialize};
use serde_json::Value;

use crate::core::grid::Cell;
use crate::game::spell::{Presentation, SpellId};
use crate::game::state::{MatchPhase, UserId};

/// Broadcast produced by a handler or a deferred action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum GameEvent {
    /// Match phase changed.
    PhaseChanged {
        /// New phase.
        phase: MatchPhase,
    },

    /// Caster raised a spell.
    SpellPrep {
        /// Acting player.
        user_id: UserId,
        /// Spell id.
        spell_id: SpellId,
        /// Opaque prep animation definition.
        prep_anim: Value,
    },

    /// Caster lowered a prepared spell.
    SpellPrepCancel {
        /// Acting player.
        user_id: UserId,
    },

    /// Spell resolved.
    SpellCast {
        /// Acting player.
        user_id: UserId,
        /// Spell id.
        spell_id: SpellId,
        /// Target cells in submission order.
        targets: Vec<Cell>,
        /// Opaque cast animation definition.
        cast_anim: Value,
        /// Presentation metadata from the catalog.
        presentation: Presentation,
    },

    /// Delayed hit notification.
    SpellHit {
        /// Damaged player.
        target_user_id: UserId,
        /// Caster.
        caster_user_id: UserId,
        /// Spell id.
        spell_id: SpellId,
    },

    /// Delayed teleport landed.
    TeleportConfirm {
        /// Acting player.
        user_id: UserId,
        /// Landing cell.
        destination: Cell,
    },
}

impl GameEvent {
    /// Create phase changed event.
    pub fn phase_changed(phase: MatchPhase) -> Self {
        GameEvent::PhaseChanged { phase }
    }

    /// Create spell prep cancel event.
    pub fn prep_cancelled(user_id: &str) -> Self {
        GameEvent::SpellPrepCancel { user_id: user_id.to_string() }
    }
}

/// Generation stamp carried by deferred actions.
///
/// The match bumps its epoch when it leaves GAME and again when it is
/// disposed; an action whose token no longer matches is dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidityToken {
    /// Match epoch at scheduling time.
    pub epoch: u64,
}

/// Side effect that fires after a delay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeferredAction {
    /// Emit a hit notification.
    SpellHit {
        /// Damaged player.
        target_user_id: UserId,
        /// Caster.
        caster_user_id: UserId,
        /// Spell id.
        spell_id: SpellId,
    },
    /// Move the caster onto the teleport destination.
    CommitTeleport {
        /// Caster being moved.
        user_id: UserId,
        /// Spell id.
        spell_id: SpellId,
        /// Landing cell.
        destination: Cell,
    },
    /// Drop the published path unless a newer one replaced it.
    ClearPath {
        /// Player whose path is cleared.
        user_id: UserId,
        /// Path sequence number at scheduling time.
        path_seq: u64,
    },
    /// Tear the match down.
    Dispose,
}

/// A deferred action plus its delay and token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Scheduled {
    /// Delay in milliseconds from scheduling.
    pub delay_ms: u64,
    /// What to do.
    pub action: DeferredAction,
    /// Validity stamp.
    pub token: ValidityToken,
}
