//! Filtered Match Snapshot
//!
//! What one viewer is allowed to see. The same truth, viewer team and phase
//! always produce byte-identical JSON, so the digest in `gameState` can be
//! compared across clients.
//!
//! Hidden from the opposing team:
//! - PREPARATION: the whole team, including its turn-order slots
//! - GAME: unrevealed invisible players, omitted entirely
//! - before STATS: spell loadouts and triggered entities (traps)

use serde::{Serialize, Deserialize};

use crate::core::grid::Cell;
use crate::core::hash::snapshot_digest;
use crate::game::events::GameEvent;
use crate::game::spell::SpellId;
use crate::game::state::{
    CharacterProfile, GroundEffectInstance, Match, MatchPhase, Player, SpawnedEntity,
    StatusEffectInstance, Team, TerrainModification, UserId,
};
use crate::game::stats::MatchStats;

/// One player as a particular viewer sees them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerView {
    /// Account id.
    pub user_id: UserId,
    /// Display name.
    pub username: String,
    /// Character id.
    pub character_id: String,
    /// Character class.
    pub character_class: String,
    /// Looked-up profile, if any.
    pub character: Option<CharacterProfile>,
    /// Side.
    pub team: Team,
    /// Current cell.
    pub position: Cell,
    /// Facing in radians.
    pub orientation: f64,
    /// Current health.
    pub health: u32,
    /// Health cap.
    pub max_health: u32,
    /// Current energy.
    pub energy: u32,
    /// Energy cap.
    pub max_energy: u32,
    /// Movement points this turn, grants included.
    pub movement_points: u32,
    /// Per-turn movement refill.
    pub max_movement_points: u32,
    /// Spent this turn.
    pub used_movement_points: u32,
    /// Ready flag from PREPARATION.
    pub ready: bool,
    /// A session is attached.
    pub connected: bool,
    /// Invisible, and the viewer may know it.
    pub invisible: bool,
    /// Active statuses.
    pub status_effects: Vec<StatusEffectInstance>,
    /// `None` for opponents until STATS.
    pub spell_loadout: Option<Vec<SpellId>>,
    /// Empty when hidden.
    pub last_path: Vec<Cell>,
}

/// A team as a viewer sees it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamView {
    /// Side.
    pub id: Team,
    /// Start cells.
    pub start_zone: Vec<Cell>,
    /// Members this viewer may see.
    pub players: Vec<PlayerView>,
}

/// Full filtered snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchView {
    /// Match id.
    pub match_id: String,
    /// Map id.
    pub map_id: String,
    /// Current phase.
    pub phase: MatchPhase,
    /// Starts at 1 when GAME begins.
    pub turn: u32,
    /// Turn order, limited to own team in PREPARATION.
    pub turn_order: Vec<UserId>,
    /// Player whose turn it is.
    pub current_player_id: Option<UserId>,
    /// Team the snapshot was filtered for.
    pub viewer_team: Option<Team>,
    /// Map width in cells.
    pub width: i32,
    /// Map height in cells.
    pub height: i32,
    /// Teams this viewer may see.
    pub teams: Vec<TeamView>,
    /// Active ground effects.
    pub ground_effects: Vec<GroundEffectInstance>,
    /// Live terrain changes.
    pub terrain_modifications: Vec<TerrainModification>,
    /// Traps of the other team are left out.
    pub entities: Vec<SpawnedEntity>,
    /// Winning side, once decided.
    pub winner: Option<Team>,
    /// Filled in STATS.
    pub stats: Option<MatchStats>,
}

impl MatchView {
    /// Build the snapshot `viewer` is allowed to see. `None` sees only what
    /// both teams would see.
    pub fn build(m: &Match, viewer: Option<Team>) -> Self {
        let teams = m
            .teams
            .values()
            .filter(|team| m.phase != MatchPhase::Preparation || viewer == Some(team.id))
            .map(|team| TeamView {
                id: team.id,
                start_zone: team.start_zone.clone(),
                players: team
                    .members
                    .iter()
                    .filter_map(|id| m.player(id))
                    .filter(|p| is_visible_to(m.phase, p, viewer))
                    .map(|p| player_view(p, m.phase, viewer))
                    .collect(),
            })
            .collect();

        let turn_order = match m.phase {
            MatchPhase::Preparation => m
                .turn_order
                .iter()
                .filter(|id| viewer.is_some() && m.team_of(id) == viewer)
                .cloned()
                .collect(),
            _ => m.turn_order.clone(),
        };

        let entities = m
            .entities
            .values()
            .filter(|e| m.phase == MatchPhase::Stats || viewer == Some(e.owner_team) || e.trigger.is_none())
            .cloned()
            .collect();

        Self {
            match_id: m.match_id.clone(),
            map_id: m.map_id.clone(),
            phase: m.phase,
            turn: m.turn,
            turn_order,
            current_player_id: m.current_player_id.clone(),
            viewer_team: viewer,
            width: m.terrain.width(),
            height: m.terrain.height(),
            teams,
            ground_effects: m.ground_effects.values().cloned().collect(),
            terrain_modifications: m.terrain_modifications.values().cloned().collect(),
            entities,
            winner: m.winner,
            stats: m.stats.clone(),
        }
    }

    /// Hex SHA-256 of this snapshot's JSON.
    pub fn digest(&self) -> Result<String, serde_json::Error> {
        snapshot_digest(self)
    }

    /// Find a player in the snapshot.
    pub fn player(&self, user_id: &str) -> Option<&PlayerView> {
        self.teams.iter().flat_map(|t| t.players.iter()).find(|p| p.user_id == user_id)
    }
}

/// May `viewer` see `p` at all in this phase?
pub fn is_visible_to(phase: MatchPhase, p: &Player, viewer: Option<Team>) -> bool {
    if viewer == Some(p.team) {
        return true;
    }
    match phase {
        MatchPhase::Preparation => false,
        MatchPhase::Game => !p.is_hidden_from_enemies(),
        MatchPhase::Stats => true,
    }
}

/// May `viewer` receive `event`? Events naming a player the viewer cannot
/// see are withheld, the same way the snapshot omits that player.
pub fn event_visible_to(m: &Match, event: &GameEvent, viewer: Option<Team>) -> bool {
    let actors: Vec<&str> = match event {
        GameEvent::PhaseChanged { .. } => return true,
        GameEvent::SpellPrep { user_id, .. }
        | GameEvent::SpellPrepCancel { user_id }
        | GameEvent::SpellCast { user_id, .. }
        | GameEvent::TeleportConfirm { user_id, .. } => vec![user_id.as_str()],
        GameEvent::SpellHit { target_user_id, caster_user_id, .. } => {
            vec![caster_user_id.as_str(), target_user_id.as_str()]
        }
    };
    actors
        .into_iter()
        .filter_map(|id| m.player(id))
        .all(|p| is_visible_to(m.phase, p, viewer))
}

fn player_view(p: &Player, phase: MatchPhase, viewer: Option<Team>) -> PlayerView {
    let loadout_visible = viewer == Some(p.team) || phase == MatchPhase::Stats;

    PlayerView {
        user_id: p.user_id.clone(),
        username: p.username.clone(),
        character_id: p.character_id.clone(),
        character_class: p.character_class.clone(),
        character: p.character.clone(),
        team: p.team,
        position: p.position,
        orientation: p.orientation,
        health: p.health,
        max_health: p.max_health,
        energy: p.energy,
        max_energy: p.max_energy,
        movement_points: p.movement_points,
        max_movement_points: p.max_movement_points,
        used_movement_points: p.used_movement_points,
        ready: p.ready,
        connected: p.connected,
        invisible: p.is_invisible(),
        status_effects: p.status_effects.values().cloned().collect(),
        spell_loadout: loadout_visible.then(|| p.spell_loadout.clone()),
        last_path: p.last_path.clone(),
    }
}
