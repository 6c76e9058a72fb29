//! Match State Definitions
//!
//! The match aggregate and every record it owns. Per-cell maps are keyed by
//! [`Cell`] and per-player maps by user id, all in `BTreeMap`s so iteration
//! (and therefore serialization and tick order) is deterministic.

use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::grid::{Cell, centroid};
use crate::game::spell::{AreaDeltas, Deltas, SpellId, TriggerSpec};
use crate::game::stats::MatchStats;
use crate::game::terrain::{StartZones, TerrainModel, TerrainView};

pub use crate::game::terrain::TerrainModification;

/// Account identifier, as issued by the account service.
pub type UserId = String;

/// Spawned entity identifier (monotonic per match).
pub type EntityId = u32;

// =============================================================================
// TEAM
// =============================================================================

/// One of the two sides.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Team {
    /// First side.
    A,
    /// Second side.
    B,
}

impl Team {
    /// The other side.
    #[inline]
    pub fn opponent(self) -> Team {
        match self {
            Team::A => Team::B,
            Team::B => Team::A,
        }
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Team::A => "A",
            Team::B => "B",
        }
    }
}

/// Team membership and start zone.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamState {
    /// Side.
    pub id: Team,
    /// Members in roster order.
    pub members: Vec<UserId>,
    /// Cells members may start on.
    pub start_zone: Vec<Cell>,
}

// =============================================================================
// MATCH PHASE
// =============================================================================

/// Match lifecycle phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchPhase {
    /// Players pick start cells and ready up.
    #[default]
    Preparation,
    /// Turn-based play.
    Game,
    /// Results screen; terminal.
    Stats,
}

// =============================================================================
// PLAYER RECORDS
// =============================================================================

/// Starting resource caps for a player.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseStats {
    /// Max health.
    pub max_health: u32,
    /// Max energy.
    pub max_energy: u32,
    /// Max movement points.
    pub max_movement_points: u32,
}

impl Default for BaseStats {
    fn default() -> Self {
        Self {
            max_health: 50,
            max_energy: 6,
            max_movement_points: 3,
        }
    }
}

/// Character profile filled in by the character lookup.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CharacterProfile {
    /// Display name.
    pub display_name: String,
    /// Character level.
    pub level: u32,
    /// Opaque appearance data.
    pub appearance: Value,
}

/// Per-player combat counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CombatStats {
    /// Health removed from others.
    pub damage_dealt: u32,
    /// Health lost.
    pub damage_taken: u32,
    /// Health restored to anyone.
    pub healing_done: u32,
    /// Successful casts.
    pub spells_cast: u32,
    /// Cells walked.
    pub cells_moved: u32,
    /// Turns completed.
    pub turns_played: u32,
}

/// Active status effect on a player.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEffectInstance {
    /// Effect id (map key).
    pub effect_id: String,
    /// Spell that applied it.
    pub source_spell_id: SpellId,
    /// Caster that applied it.
    pub source_user_id: UserId,
    /// Remaining turns.
    pub duration: u32,
    /// Current stacks (≥ 1).
    pub stacks: u32,
    /// Stack cap.
    pub max_stacks: u32,
    /// Whether reapplying stacks.
    pub stackable: bool,
    /// Fired on creation.
    pub on_apply: Deltas,
    /// Fired at the bearer's turn start.
    pub on_turn_start: Deltas,
    /// Fired at the bearer's turn end.
    pub on_turn_end: Deltas,
    /// Fired on expiry.
    pub on_remove: Deltas,
    /// Grants invisibility while active.
    pub grants_invisibility: bool,
    /// Reveals an invisible bearer.
    pub reveals_invisibility: bool,
}

/// Invisibility window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invisibility {
    /// Status effect that granted it.
    pub source_effect_id: String,
    /// Remaining turns.
    pub remaining: u32,
}

/// A combatant.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    /// Account id.
    pub user_id: UserId,
    /// Display name from the roster.
    pub username: String,
    /// Character id from the roster.
    pub character_id: String,
    /// Character class from the roster.
    pub character_class: String,
    /// Looked-up profile; `None` when the lookup failed.
    pub character: Option<CharacterProfile>,
    /// Side.
    pub team: Team,
    /// Spells this player may cast.
    pub spell_loadout: Vec<SpellId>,

    /// Current cell.
    pub position: Cell,
    /// Facing in radians, (−π, π].
    pub orientation: f64,

    /// Current health.
    pub health: u32,
    /// Max health.
    pub max_health: u32,
    /// Current energy.
    pub energy: u32,
    /// Max energy.
    pub max_energy: u32,
    /// Movement budget this turn (may exceed max after grants).
    pub movement_points: u32,
    /// Baseline movement budget.
    pub max_movement_points: u32,
    /// Movement spent this turn.
    pub used_movement_points: u32,

    /// Ready flag (preparation only).
    pub ready: bool,
    /// Active statuses, keyed by effect id.
    pub status_effects: BTreeMap<String, StatusEffectInstance>,
    /// Active invisibility window.
    pub invisibility: Option<Invisibility>,

    /// Most recent committed path, kept briefly for client animation.
    pub last_path: Vec<Cell>,
    /// Bumped on every published path.
    pub path_seq: u64,

    /// Counters for the stats screen.
    pub stats: CombatStats,
    /// Whether a session is attached.
    pub connected: bool,
}

impl Player {
    /// Movement points still available this turn.
    #[inline]
    pub fn remaining_movement(&self) -> u32 {
        self.movement_points.saturating_sub(self.used_movement_points)
    }

    /// Currently invisible.
    #[inline]
    pub fn is_invisible(&self) -> bool {
        self.invisibility.is_some()
    }

    /// A status currently reveals this player.
    pub fn is_revealed(&self) -> bool {
        self.status_effects.values().any(|s| s.reveals_invisibility)
    }

    /// Hidden from the opposing team right now.
    pub fn is_hidden_from_enemies(&self) -> bool {
        self.is_invisible() && !self.is_revealed()
    }

    /// Still standing.
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.health > 0
    }

    /// Apply flat deltas with clamping. Returns the signed health change
    /// actually applied.
    ///
    /// Movement points never drop below what was already spent this turn.
    pub fn apply_deltas(&mut self, deltas: Deltas) -> i32 {
        let before = self.health as i64;
        self.health = clamp_add(self.health, deltas.health, self.max_health);
        self.energy = clamp_add(self.energy, deltas.energy, self.max_energy);
        self.movement_points =
            clamp_add(self.movement_points, deltas.movement, u32::MAX).max(self.used_movement_points);
        let change = self.health as i64 - before;
        if change < 0 {
            self.stats.damage_taken = self.stats.damage_taken.saturating_add((-change) as u32);
        }
        change as i32
    }
}

/// `value + delta`, clamped into `[0, max]`.
#[inline]
pub fn clamp_add(value: u32, delta: i32, max: u32) -> u32 {
    (value as i64 + delta as i64).clamp(0, max as i64) as u32
}

// =============================================================================
// FIELD RECORDS
// =============================================================================

/// A ground effect stamped onto one cell.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundEffectInstance {
    /// Cell (map key).
    pub cell: Cell,
    /// Effect id.
    pub effect_id: String,
    /// Spell that created it.
    pub source_spell_id: SpellId,
    /// Caster that created it.
    pub source_user_id: UserId,
    /// Remaining turns; 0 = permanent.
    pub duration: u32,
    /// Applied when a unit ends a move here.
    pub on_enter: Deltas,
    /// Applied when a unit starts its turn here.
    pub on_turn_start: Deltas,
    /// Cell cannot be entered.
    pub blocks_movement: bool,
    /// Cell blocks line of sight.
    pub blocks_vision: bool,
}

/// A spawned field entity (wall block, trap, totem...).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnedEntity {
    /// Entity id (map key).
    pub id: EntityId,
    /// Entity type.
    pub entity_type: String,
    /// Owner side.
    pub owner_team: Team,
    /// Owner.
    pub owner_user_id: UserId,
    /// Spell that spawned it.
    pub source_spell_id: SpellId,
    /// Cell.
    pub position: Cell,
    /// Hit points; `None` = indestructible.
    pub health: Option<u32>,
    /// Max hit points.
    pub max_health: Option<u32>,
    /// Remaining turns; 0 = permanent.
    pub duration: u32,
    /// What wakes it.
    pub trigger: Option<TriggerSpec>,
    /// Applied to the triggering player(s).
    pub on_trigger: Deltas,
    /// Area burst on death or expiry.
    pub on_death: Option<AreaDeltas>,
    /// Occupies its cell for movement.
    pub blocks_movement: bool,
    /// Occupies its cell for vision.
    pub blocks_vision: bool,
    /// Creation order within the match.
    pub created_seq: u64,
}

// =============================================================================
// SETUP
// =============================================================================

/// One roster entry, already decoded.
#[derive(Clone, Debug)]
pub struct PlayerSeed {
    /// Account id.
    pub user_id: UserId,
    /// Display name.
    pub username: String,
    /// Character id.
    pub character_id: String,
    /// Character class.
    pub character_class: String,
    /// Side.
    pub team: Team,
    /// Spell ids.
    pub spell_loadout: Vec<SpellId>,
    /// Resource caps.
    pub base: BaseStats,
}

/// Match construction errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SetupError {
    /// The same user appears twice.
    #[error("user {0} appears more than once in the roster")]
    DuplicatePlayer(UserId),
    /// A side has nobody on it.
    #[error("team {0:?} has no players")]
    EmptyTeam(Team),
    /// More players than free start cells.
    #[error("team {0:?} has more players than start cells")]
    StartZoneFull(Team),
}

// =============================================================================
// MATCH
// =============================================================================

/// Complete authoritative state of one match.
#[derive(Clone, Debug)]
pub struct Match {
    /// Match id.
    pub match_id: String,
    /// Map id.
    pub map_id: String,
    /// Current phase.
    pub phase: MatchPhase,
    /// Turns completed.
    pub turn: u32,
    /// Turn sequence.
    pub turn_order: Vec<UserId>,
    /// Whose turn it is (GAME only).
    pub current_player_id: Option<UserId>,

    /// Both sides.
    pub teams: BTreeMap<Team, TeamState>,
    /// Every player keyed by user id.
    pub players: BTreeMap<UserId, Player>,

    /// Static grid.
    pub terrain: TerrainModel,
    /// Ground effects keyed by cell.
    pub ground_effects: BTreeMap<Cell, GroundEffectInstance>,
    /// Terrain modifications keyed by cell.
    pub terrain_modifications: BTreeMap<Cell, TerrainModification>,
    /// Spawned entities keyed by id.
    pub entities: BTreeMap<EntityId, SpawnedEntity>,
    /// Next entity id.
    pub next_entity_id: EntityId,
    /// Next entity creation sequence.
    pub next_entity_seq: u64,

    /// Open spell-prep presentations (user → spell).
    pub spell_prep: BTreeMap<UserId, SpellId>,
    /// Validity generation for deferred actions.
    pub epoch: u64,
    /// Winning side, once decided.
    pub winner: Option<Team>,
    /// GAME entry time.
    pub started_at: Option<DateTime<Utc>>,
    /// STATS entry time.
    pub ended_at: Option<DateTime<Utc>>,
    /// Results blob, filled on STATS entry.
    pub stats: Option<MatchStats>,
}

impl Match {
    /// Create a match from a validated terrain model and a roster.
    ///
    /// Players are placed on the first free cells of their start zone and
    /// face the opposing zone. Turn order alternates sides in roster order.
    pub fn new(
        match_id: impl Into<String>,
        map_id: impl Into<String>,
        terrain: TerrainModel,
        zones: &StartZones,
        roster: Vec<PlayerSeed>,
    ) -> Result<Self, SetupError> {
        let mut teams = BTreeMap::new();
        teams.insert(Team::A, TeamState { id: Team::A, members: Vec::new(), start_zone: zones.a.clone() });
        teams.insert(Team::B, TeamState { id: Team::B, members: Vec::new(), start_zone: zones.b.clone() });

        let mut players: BTreeMap<UserId, Player> = BTreeMap::new();
        for seed in roster {
            if players.contains_key(&seed.user_id) {
                return Err(SetupError::DuplicatePlayer(seed.user_id));
            }
            let zone = &teams[&seed.team].start_zone;
            let taken: Vec<Cell> = players.values().map(|p| p.position).collect();
            let position = zone
                .iter()
                .copied()
                .find(|c| !taken.contains(c))
                .ok_or(SetupError::StartZoneFull(seed.team))?;
            let facing = teams[&seed.team.opponent()].start_zone.as_slice();
            let orientation = centroid(facing).map(|c| position.angle_to(c)).unwrap_or(0.0);

            if let Some(team) = teams.get_mut(&seed.team) {
                team.members.push(seed.user_id.clone());
            }
            players.insert(seed.user_id.clone(), Player {
                user_id: seed.user_id,
                username: seed.username,
                character_id: seed.character_id,
                character_class: seed.character_class,
                character: None,
                team: seed.team,
                spell_loadout: seed.spell_loadout,
                position,
                orientation,
                health: seed.base.max_health,
                max_health: seed.base.max_health,
                energy: seed.base.max_energy,
                max_energy: seed.base.max_energy,
                movement_points: seed.base.max_movement_points,
                max_movement_points: seed.base.max_movement_points,
                used_movement_points: 0,
                ready: false,
                status_effects: BTreeMap::new(),
                invisibility: None,
                last_path: Vec::new(),
                path_seq: 0,
                stats: CombatStats::default(),
                connected: false,
            });
        }

        for (id, team) in &teams {
            if team.members.is_empty() {
                return Err(SetupError::EmptyTeam(*id));
            }
        }

        let turn_order = interleave(&teams[&Team::A].members, &teams[&Team::B].members);

        Ok(Self {
            match_id: match_id.into(),
            map_id: map_id.into(),
            phase: MatchPhase::Preparation,
            turn: 0,
            turn_order,
            current_player_id: None,
            teams,
            players,
            terrain,
            ground_effects: BTreeMap::new(),
            terrain_modifications: BTreeMap::new(),
            entities: BTreeMap::new(),
            next_entity_id: 1,
            next_entity_seq: 0,
            spell_prep: BTreeMap::new(),
            epoch: 0,
            winner: None,
            started_at: None,
            ended_at: None,
            stats: None,
        })
    }

    /// Live terrain (base grid plus modifications).
    #[inline]
    pub fn terrain_view(&self) -> TerrainView<'_> {
        self.terrain.view(&self.terrain_modifications)
    }

    /// Look up a player.
    #[inline]
    pub fn player(&self, user_id: &str) -> Option<&Player> {
        self.players.get(user_id)
    }

    /// Look up a player mutably.
    #[inline]
    pub fn player_mut(&mut self, user_id: &str) -> Option<&mut Player> {
        self.players.get_mut(user_id)
    }

    /// Is it this player's turn?
    pub fn is_current(&self, user_id: &str) -> bool {
        self.phase == MatchPhase::Game && self.current_player_id.as_deref() == Some(user_id)
    }

    /// Player standing on a cell.
    pub fn unit_at(&self, cell: Cell) -> Option<&Player> {
        self.players.values().find(|p| p.position == cell)
    }

    /// Entity standing on a cell.
    pub fn entity_at(&self, cell: Cell) -> Option<&SpawnedEntity> {
        self.entities.values().find(|e| e.position == cell)
    }

    /// Any unit or entity on the cell.
    pub fn is_occupied(&self, cell: Cell) -> bool {
        self.unit_at(cell).is_some() || self.entity_at(cell).is_some()
    }

    /// Can `mover` not step onto `cell`? Terrain is checked separately.
    pub fn blocks_movement(&self, cell: Cell, mover: &str) -> bool {
        self.players.values().any(|p| p.position == cell && p.user_id != mover)
            || self.entities.values().any(|e| e.position == cell && e.blocks_movement)
            || self.ground_effects.get(&cell).is_some_and(|g| g.blocks_movement)
    }

    /// Does something standing on `cell` stop a sight ray?
    ///
    /// Invisible players are transparent.
    pub fn blocks_vision(&self, cell: Cell) -> bool {
        self.players.values().any(|p| p.position == cell && !p.is_invisible())
            || self.entities.values().any(|e| e.position == cell && e.blocks_vision)
            || self.ground_effects.get(&cell).is_some_and(|g| g.blocks_vision)
    }

    /// All players are ready.
    pub fn all_ready(&self) -> bool {
        !self.players.is_empty() && self.players.values().all(|p| p.ready)
    }

    /// Allocate an entity id and creation sequence number.
    pub fn allocate_entity(&mut self) -> (EntityId, u64) {
        let id = self.next_entity_id;
        let seq = self.next_entity_seq;
        self.next_entity_id = self.next_entity_id.wrapping_add(1);
        self.next_entity_seq += 1;
        (id, seq)
    }

    /// Team of a player.
    pub fn team_of(&self, user_id: &str) -> Option<Team> {
        self.players.get(user_id).map(|p| p.team)
    }
}

/// Alternate two member lists, then append whatever is left.
fn interleave(a: &[UserId], b: &[UserId]) -> Vec<UserId> {
    let mut order = Vec::with_capacity(a.len() + b.len());
    for i in 0..a.len().max(b.len()) {
        if let Some(id) = a.get(i) {
            order.push(id.clone());
        }
        if let Some(id) = b.get(i) {
            order.push(id.clone());
        }
    }
    order
}
