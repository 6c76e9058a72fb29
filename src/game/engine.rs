//! Match State Machine
//!
//! Inbound handlers for one match. Every handler validates first and only
//! then mutates; a failed validation returns a [`Rejection`] and leaves the
//! match untouched. Successful handlers return an [`Outcome`] carrying the
//! broadcasts to send now and the deferred actions to schedule.
//!
//! Phases: PREPARATION → GAME (everyone ready) → STATS (external end-game
//! call, terminal, disposed after a delay).

use std::sync::Arc;
use chrono::Utc;
use thiserror::Error;

use crate::core::grid::{Cell, centroid, normalize_angle};
use crate::game::effects::{apply_effect, EffectReport, Provenance, ResolvedTarget};
use crate::game::events::{DeferredAction, GameEvent, Scheduled, ValidityToken};
use crate::game::los::has_line_of_sight;
use crate::game::pathfinding::{find_path, path_cost, validate_path};
use crate::game::spell::{SpellCatalog, SpellId, TargetKind};
use crate::game::state::{CharacterProfile, Match, MatchPhase, Team, UserId};
use crate::game::stats::MatchStats;
use crate::game::targeting::{affected_entities, affected_units, is_selectable, pattern_cells};
use crate::game::tick::{begin_turn, finish_turn, fire_movement_triggers, global_tick};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Delays for the engine's own deferred actions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MatchTimings {
    /// How long a committed path stays published.
    pub path_clear_delay_ms: u64,
    /// How long STATS lasts before disposal.
    pub stats_dispose_delay_ms: u64,
}

impl Default for MatchTimings {
    fn default() -> Self {
        Self {
            path_clear_delay_ms: 1_500,
            stats_dispose_delay_ms: 60_000,
        }
    }
}

// =============================================================================
// RESULTS
// =============================================================================

/// Why a handler refused to act. Never sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    /// Handler not allowed in this phase.
    #[error("not allowed during {0:?}")]
    WrongPhase(MatchPhase),
    /// Caller is not on the roster.
    #[error("unknown player {0}")]
    UnknownPlayer(UserId),
    /// Caller is not the current player.
    #[error("not your turn")]
    NotYourTurn,
    /// Start cell outside the caller's zone.
    #[error("{0} is outside your start zone")]
    OutsideStartZone(Cell),
    /// Cell taken.
    #[error("{0} is occupied")]
    CellOccupied(Cell),
    /// Destination equals the current cell.
    #[error("already at {0}")]
    AlreadyThere(Cell),
    /// Destination cannot be stood on.
    #[error("{0} is not walkable")]
    NotWalkable(Cell),
    /// Path would cost more than the remaining budget.
    #[error("path costs {cost}, {remaining} movement left")]
    InsufficientMovement {
        /// Path cost.
        cost: u32,
        /// Points left this turn.
        remaining: u32,
    },
    /// No route within the remaining budget.
    #[error("no path to {0} within budget")]
    NoPath(Cell),
    /// Spell id not in the catalog.
    #[error("unknown spell {0}")]
    UnknownSpell(SpellId),
    /// Spell not in the caller's loadout.
    #[error("spell {0} is not in your loadout")]
    NotInLoadout(SpellId),
    /// Not enough energy.
    #[error("spell costs {cost}, {energy} energy left")]
    InsufficientEnergy {
        /// Spell cost.
        cost: u32,
        /// Caster energy.
        energy: u32,
    },
    /// Empty or oversized target list.
    #[error("expected 1..={max} targets, got {given}")]
    BadTargetCount {
        /// Targets submitted.
        given: usize,
        /// Spell maximum.
        max: usize,
    },
    /// Target outside the spell's range.
    #[error("{cell} is {distance} away, outside range")]
    OutOfRange {
        /// Target.
        cell: Cell,
        /// Manhattan distance from the caster.
        distance: u32,
    },
    /// Target cell or unit not acceptable.
    #[error("invalid target {0}")]
    InvalidTarget(Cell),
    /// Sight ray blocked.
    #[error("no line of sight to {0}")]
    NoLineOfSight(Cell),
    /// Nothing to cancel.
    #[error("no spell prepared")]
    NothingPrepared,
    /// Deferred action outlived its match generation or was superseded.
    #[error("stale deferred action")]
    Stale,
}

/// Successful handler result.
#[derive(Debug, Default)]
pub struct Outcome {
    /// Broadcast now, in order.
    pub events: Vec<GameEvent>,
    /// Schedule for later.
    pub deferred: Vec<Scheduled>,
    /// Whether the filtered snapshot must be re-sent.
    pub state_changed: bool,
    /// Tear the match down.
    pub dispose: bool,
}

impl Outcome {
    fn changed() -> Self {
        Self { state_changed: true, ..Self::default() }
    }

    fn with_event(mut self, event: GameEvent) -> Self {
        self.events.push(event);
        self
    }
}

type HandlerResult = Result<Outcome, Rejection>;

// =============================================================================
// ENGINE
// =============================================================================

/// One match plus the read-only data it needs.
pub struct MatchEngine {
    state: Match,
    catalog: Arc<SpellCatalog>,
    timings: MatchTimings,
}

impl MatchEngine {
    /// Wrap a freshly created match.
    pub fn new(state: Match, catalog: Arc<SpellCatalog>, timings: MatchTimings) -> Self {
        Self { state, catalog, timings }
    }

    /// Read the match.
    pub fn state(&self) -> &Match {
        &self.state
    }

    /// Mutate the match directly (setup and tests).
    pub fn state_mut(&mut self) -> &mut Match {
        &mut self.state
    }

    /// Spell catalog.
    pub fn catalog(&self) -> &SpellCatalog {
        &self.catalog
    }

    fn token(&self) -> ValidityToken {
        ValidityToken { epoch: self.state.epoch }
    }

    fn schedule(&self, delay_ms: u64, action: DeferredAction) -> Scheduled {
        Scheduled { delay_ms, action, token: self.token() }
    }

    fn require_phase(&self, phase: MatchPhase) -> Result<(), Rejection> {
        if self.state.phase != phase {
            return Err(Rejection::WrongPhase(self.state.phase));
        }
        Ok(())
    }

    fn require_player(&self, user_id: &str) -> Result<(), Rejection> {
        if self.state.player(user_id).is_none() {
            return Err(Rejection::UnknownPlayer(user_id.to_string()));
        }
        Ok(())
    }

    fn require_turn(&self, user_id: &str) -> Result<(), Rejection> {
        self.require_phase(MatchPhase::Game)?;
        self.require_player(user_id)?;
        if !self.state.is_current(user_id) {
            return Err(Rejection::NotYourTurn);
        }
        Ok(())
    }

    // =========================================================================
    // Session bookkeeping
    // =========================================================================

    /// Mark a player's session attached or dropped. Gameplay is unaffected.
    pub fn set_connected(&mut self, user_id: &str, connected: bool) {
        if let Some(p) = self.state.player_mut(user_id) {
            p.connected = connected;
        }
    }

    /// Fill in a looked-up character profile.
    pub fn set_character(&mut self, user_id: &str, profile: Option<CharacterProfile>) {
        if let Some(p) = self.state.player_mut(user_id) {
            p.character = profile;
        }
    }

    // =========================================================================
    // PREPARATION
    // =========================================================================

    /// Set (or toggle) readiness; starts the game once everyone is ready.
    pub fn set_ready(&mut self, user_id: &str, ready: Option<bool>) -> HandlerResult {
        self.require_phase(MatchPhase::Preparation)?;
        let player = self
            .state
            .player_mut(user_id)
            .ok_or_else(|| Rejection::UnknownPlayer(user_id.to_string()))?;
        player.ready = ready.unwrap_or(!player.ready);

        let mut outcome = Outcome::changed();
        if self.state.all_ready() {
            self.start_game(&mut outcome);
        }
        Ok(outcome)
    }

    fn start_game(&mut self, outcome: &mut Outcome) {
        let m = &mut self.state;
        m.phase = MatchPhase::Game;
        m.turn = 1;
        m.started_at = Some(Utc::now());
        m.current_player_id = m.turn_order.first().cloned();
        if let Some(first) = m.current_player_id.clone() {
            begin_turn(m, &first);
        }
        outcome.events.push(GameEvent::phase_changed(MatchPhase::Game));
    }

    /// Move to another cell of the caller's start zone.
    pub fn choose_start_position(&mut self, user_id: &str, cell: Cell) -> HandlerResult {
        self.require_phase(MatchPhase::Preparation)?;
        let team = self
            .state
            .team_of(user_id)
            .ok_or_else(|| Rejection::UnknownPlayer(user_id.to_string()))?;

        if !self.state.teams[&team].start_zone.contains(&cell) {
            return Err(Rejection::OutsideStartZone(cell));
        }
        if self.state.unit_at(cell).is_some_and(|p| p.user_id != user_id) || self.state.entity_at(cell).is_some() {
            return Err(Rejection::CellOccupied(cell));
        }

        let facing = centroid(&self.state.teams[&team.opponent()].start_zone);
        if let Some(p) = self.state.player_mut(user_id) {
            p.position = cell;
            if let Some(target) = facing {
                p.orientation = cell.angle_to(target);
            }
        }
        Ok(Outcome::changed())
    }

    // =========================================================================
    // GAME: movement
    // =========================================================================

    /// Walk to `dest`, preferring a valid client path over A*.
    pub fn request_movement(&mut self, user_id: &str, dest: Cell, client_path: Option<Vec<Cell>>) -> HandlerResult {
        self.require_turn(user_id)?;
        let m = &self.state;
        let Some(player) = m.player(user_id) else {
            return Err(Rejection::UnknownPlayer(user_id.to_string()));
        };
        let start = player.position;
        let remaining = player.remaining_movement();

        if dest == start {
            return Err(Rejection::AlreadyThere(dest));
        }
        let view = m.terrain_view();
        if !view.is_walkable(dest) {
            return Err(Rejection::NotWalkable(dest));
        }
        let obstacles = |c: Cell| m.blocks_movement(c, user_id);
        if obstacles(dest) {
            return Err(Rejection::CellOccupied(dest));
        }
        let direct = start.manhattan(dest);
        if direct > remaining {
            return Err(Rejection::InsufficientMovement { cost: direct, remaining });
        }

        let path = client_path
            .filter(|p| validate_path(&view, &obstacles, p, start, dest))
            .filter(|p| path_cost(p) <= remaining)
            .unwrap_or_else(|| find_path(&view, &obstacles, start, dest, Some(remaining)));
        if path.len() < 2 {
            return Err(Rejection::NoPath(dest));
        }
        let cost = path_cost(&path);
        if cost > remaining {
            return Err(Rejection::InsufficientMovement { cost, remaining });
        }

        let on_enter = m.ground_effects.get(&dest).map(|g| g.on_enter);
        let facing = path[path.len() - 2].angle_to(dest);

        let m = &mut self.state;
        let Some(player) = m.player_mut(user_id) else {
            return Err(Rejection::UnknownPlayer(user_id.to_string()));
        };
        player.position = dest;
        player.used_movement_points += cost;
        player.stats.cells_moved += cost;
        player.orientation = facing;
        player.path_seq += 1;
        let path_seq = player.path_seq;
        if let Some(deltas) = on_enter {
            player.apply_deltas(deltas);
        }
        player.last_path = path;
        let entered: Vec<Cell> = player.last_path[1..].to_vec();
        fire_movement_triggers(m, user_id, &entered);

        let mut outcome = Outcome::changed();
        outcome.deferred.push(self.schedule(
            self.timings.path_clear_delay_ms,
            DeferredAction::ClearPath { user_id: user_id.to_string(), path_seq },
        ));
        Ok(outcome)
    }

    // =========================================================================
    // GAME: spells
    // =========================================================================

    fn loadout_spell(&self, user_id: &str, spell_id: &str) -> Result<(), Rejection> {
        if self.catalog.get(spell_id).is_none() {
            return Err(Rejection::UnknownSpell(spell_id.to_string()));
        }
        let in_loadout = self
            .state
            .player(user_id)
            .is_some_and(|p| p.spell_loadout.iter().any(|s| s == spell_id));
        if !in_loadout {
            return Err(Rejection::NotInLoadout(spell_id.to_string()));
        }
        Ok(())
    }

    /// Raise a spell (presentation only).
    pub fn prepare_spell(&mut self, user_id: &str, spell_id: &str) -> HandlerResult {
        self.require_turn(user_id)?;
        self.loadout_spell(user_id, spell_id)?;
        let prep_anim = self
            .catalog
            .get(spell_id)
            .map(|s| s.presentation.prep_anim.clone())
            .unwrap_or_default();
        self.state.spell_prep.insert(user_id.to_string(), spell_id.to_string());
        Ok(Outcome::changed().with_event(GameEvent::SpellPrep {
            user_id: user_id.to_string(),
            spell_id: spell_id.to_string(),
            prep_anim,
        }))
    }

    /// Lower a prepared spell.
    pub fn cancel_spell_prep(&mut self, user_id: &str) -> HandlerResult {
        self.require_turn(user_id)?;
        if self.state.spell_prep.remove(user_id).is_none() {
            return Err(Rejection::NothingPrepared);
        }
        Ok(Outcome::changed().with_event(GameEvent::prep_cancelled(user_id)))
    }

    /// Validate and resolve a cast.
    pub fn cast_spell(&mut self, user_id: &str, spell_id: &str, targets: Vec<Cell>) -> HandlerResult {
        self.require_turn(user_id)?;
        self.loadout_spell(user_id, spell_id)?;
        let catalog = Arc::clone(&self.catalog);
        let Some(spell) = catalog.get(spell_id) else {
            return Err(Rejection::UnknownSpell(spell_id.to_string()));
        };
        let Some(caster) = self.state.player(user_id) else {
            return Err(Rejection::UnknownPlayer(user_id.to_string()));
        };
        let caster_cell = caster.position;
        let caster_team = caster.team;

        if caster.energy < spell.cost {
            return Err(Rejection::InsufficientEnergy { cost: spell.cost, energy: caster.energy });
        }
        if targets.is_empty() || targets.len() > spell.max_targets {
            return Err(Rejection::BadTargetCount { given: targets.len(), max: spell.max_targets });
        }

        let m = &self.state;
        let view = m.terrain_view();
        let sight_blockers = |c: Cell| m.blocks_vision(c);
        for &target in &targets {
            let distance = caster_cell.manhattan(target);
            if !spell.range.contains(distance) {
                return Err(Rejection::OutOfRange { cell: target, distance });
            }
            match spell.target_kind {
                TargetKind::Cell => {
                    if !view.is_walkable(target) {
                        return Err(Rejection::InvalidTarget(target));
                    }
                }
                TargetKind::Unit => {
                    let selectable = m
                        .unit_at(target)
                        .is_some_and(|u| is_selectable(caster_team, u, spell.ignores_invisibility));
                    if !selectable {
                        return Err(Rejection::InvalidTarget(target));
                    }
                }
            }
            if spell.repositions_caster() && m.blocks_movement(target, user_id) {
                return Err(Rejection::CellOccupied(target));
            }
            if spell.requires_los && !has_line_of_sight(&view, &sight_blockers, caster_cell, target) {
                return Err(Rejection::NoLineOfSight(target));
            }
        }

        // resolve every target against the pre-cast board
        let resolved: Vec<ResolvedTarget> = targets
            .iter()
            .map(|&cell| {
                let area = pattern_cells(m, spell.pattern, caster_cell, cell);
                ResolvedTarget {
                    cell,
                    units: affected_units(m, spell, caster_team, &area),
                    entities: affected_entities(m, spell, caster_team, &area),
                    area,
                }
            })
            .collect();

        let m = &mut self.state;
        if let Some(caster) = m.player_mut(user_id) {
            caster.energy -= spell.cost;
            caster.stats.spells_cast += 1;
            caster.orientation = caster_cell.angle_to(targets[0]);
        }
        m.spell_prep.remove(user_id);

        let prov = Provenance { spell_id, caster_id: user_id };
        let mut report = EffectReport::default();
        for target in &resolved {
            for effect in &spell.effects {
                apply_effect(m, effect, target, prov, &mut report);
            }
        }

        let mut outcome = Outcome::changed().with_event(GameEvent::SpellCast {
            user_id: user_id.to_string(),
            spell_id: spell_id.to_string(),
            targets: targets.clone(),
            cast_anim: spell.presentation.cast_anim.clone(),
            presentation: spell.presentation.clone(),
        });
        let delay = spell.impact_delay_ms();
        for target_user_id in report.damaged {
            outcome.deferred.push(self.schedule(delay, DeferredAction::SpellHit {
                target_user_id,
                caster_user_id: user_id.to_string(),
                spell_id: spell_id.to_string(),
            }));
        }
        if let Some(destination) = report.teleport {
            outcome.deferred.push(self.schedule(delay, DeferredAction::CommitTeleport {
                user_id: user_id.to_string(),
                spell_id: spell_id.to_string(),
                destination,
            }));
        }
        Ok(outcome)
    }

    // =========================================================================
    // GAME: turn flow
    // =========================================================================

    /// Close the caller's turn and open the next one.
    pub fn end_turn(&mut self, user_id: &str) -> HandlerResult {
        self.require_turn(user_id)?;
        let mut outcome = Outcome::changed();
        let m = &mut self.state;

        if m.spell_prep.remove(user_id).is_some() {
            outcome.events.push(GameEvent::prep_cancelled(user_id));
        }
        finish_turn(m, user_id);

        let next_index = m
            .turn_order
            .iter()
            .position(|id| id == user_id)
            .map(|i| (i + 1) % m.turn_order.len())
            .unwrap_or(0);
        let next = m.turn_order.get(next_index).cloned();
        m.current_player_id = next.clone();
        m.turn += 1;

        if let Some(next) = next {
            begin_turn(m, &next);
        }
        global_tick(m);
        Ok(outcome)
    }

    /// Set facing; allowed in any phase.
    pub fn update_orientation(&mut self, user_id: &str, angle: f64) -> HandlerResult {
        let player = self
            .state
            .player_mut(user_id)
            .ok_or_else(|| Rejection::UnknownPlayer(user_id.to_string()))?;
        player.orientation = normalize_angle(angle);
        Ok(Outcome::changed())
    }

    /// External end-game call.
    pub fn end_game(&mut self, winner: Team) -> HandlerResult {
        self.require_phase(MatchPhase::Game)?;
        let m = &mut self.state;
        m.winner = Some(winner);
        m.epoch += 1;
        m.phase = MatchPhase::Stats;
        m.spell_prep.clear();
        let ended_at = Utc::now();
        m.ended_at = Some(ended_at);
        m.stats = Some(MatchStats::build(m, ended_at));

        let mut outcome = Outcome::changed().with_event(GameEvent::phase_changed(MatchPhase::Stats));
        outcome.deferred.push(self.schedule(self.timings.stats_dispose_delay_ms, DeferredAction::Dispose));
        Ok(outcome)
    }

    // =========================================================================
    // Deferred actions
    // =========================================================================

    /// Fire a deferred action if it is still valid.
    pub fn apply_deferred(&mut self, action: DeferredAction, token: ValidityToken) -> HandlerResult {
        if token != self.token() {
            return Err(Rejection::Stale);
        }
        match action {
            DeferredAction::SpellHit { target_user_id, caster_user_id, spell_id } => {
                self.require_player(&target_user_id)?;
                self.require_player(&caster_user_id)?;
                Ok(Outcome::default().with_event(GameEvent::SpellHit {
                    target_user_id,
                    caster_user_id,
                    spell_id,
                }))
            }
            DeferredAction::CommitTeleport { user_id, destination, .. } => {
                self.require_player(&user_id)?;
                let m = &self.state;
                if !m.terrain_view().is_walkable(destination) {
                    return Err(Rejection::NotWalkable(destination));
                }
                if m.blocks_movement(destination, &user_id) {
                    return Err(Rejection::CellOccupied(destination));
                }
                let on_enter = m.ground_effects.get(&destination).map(|g| g.on_enter);

                let m = &mut self.state;
                if let Some(p) = m.player_mut(&user_id) {
                    p.position = destination;
                    if let Some(deltas) = on_enter {
                        p.apply_deltas(deltas);
                    }
                }
                fire_movement_triggers(m, &user_id, &[destination]);
                Ok(Outcome::changed().with_event(GameEvent::TeleportConfirm { user_id, destination }))
            }
            DeferredAction::ClearPath { user_id, path_seq } => {
                let player = self
                    .state
                    .player_mut(&user_id)
                    .ok_or_else(|| Rejection::UnknownPlayer(user_id.clone()))?;
                if player.path_seq != path_seq {
                    return Err(Rejection::Stale);
                }
                player.last_path.clear();
                Ok(Outcome::changed())
            }
            DeferredAction::Dispose => {
                self.require_phase(MatchPhase::Stats)?;
                self.state.epoch += 1;
                Ok(Outcome { dispose: true, ..Outcome::default() })
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;
    use crate::game::spell::{
        AreaPattern, DamageElement, EntitySpec, Presentation, SpellDefinition, SpellEffect,
        SpellRange, TargetFilter,
    };
    use crate::game::effects::spawn_entity;
    use crate::game::spell::{Deltas, TriggerSpec};
    use crate::game::state::tests::open_match;
    use crate::game::state::Invisibility;
    use crate::game::terrain::TileType;

    fn spell(id: &str, cost: u32, min: u32, max: u32, effects: Vec<SpellEffect>) -> SpellDefinition {
        SpellDefinition {
            id: id.into(),
            name: id.into(),
            cost,
            range: SpellRange { min, max },
            target_kind: TargetKind::Cell,
            requires_los: true,
            pattern: AreaPattern::Single,
            affects: TargetFilter::Any,
            ignores_invisibility: false,
            max_targets: 1,
            effects,
            presentation: Presentation {
                impact_delay_ms: 600,
                cast_anim: serde_json::json!({"clip": id}),
                ..Presentation::default()
            },
        }
    }

    pub(crate) fn catalog() -> SpellCatalog {
        let bolt = spell("arcane_bolt", 3, 2, 6, vec![SpellEffect::Damage { amount: 5, element: DamageElement::Magic }]);
        let mut blink = spell("blink", 2, 1, 4, vec![SpellEffect::Teleport]);
        blink.requires_los = false;
        let wall = spell("earth_wall", 1, 1, 5, vec![SpellEffect::SpawnEntity(EntitySpec {
            entity_type: "earth_block".into(),
            health: Some(10),
            duration: 0,
            trigger: None,
            on_trigger: Deltas::default(),
            on_death: None,
            blocks_movement: true,
            blocks_vision: true,
        })]);
        let mut mark = spell("mark", 1, 1, 8, vec![SpellEffect::Damage { amount: 1, element: DamageElement::Physical }]);
        mark.target_kind = TargetKind::Unit;
        mark.affects = TargetFilter::Enemy;
        SpellCatalog::from_definitions([bolt, blink, wall, mark])
    }

    /// Two-player match already in GAME with "a" to move.
    pub(crate) fn game_engine() -> MatchEngine {
        let mut m = open_match(&["a"], &["b"]);
        for p in m.players.values_mut() {
            p.spell_loadout = vec!["arcane_bolt".into(), "blink".into(), "earth_wall".into(), "mark".into()];
        }
        let mut engine = MatchEngine::new(m, Arc::new(catalog()), MatchTimings::default());
        engine.set_ready("a", Some(true)).unwrap();
        engine.set_ready("b", Some(true)).unwrap();
        engine
    }

    fn place(engine: &mut MatchEngine, user: &str, cell: Cell) {
        engine.state_mut().player_mut(user).unwrap().position = cell;
    }

    #[test]
    fn test_ready_check_starts_game() {
        let m = open_match(&["a"], &["b"]);
        let mut engine = MatchEngine::new(m, Arc::new(catalog()), MatchTimings::default());

        let first = engine.set_ready("a", None).unwrap();
        assert!(first.events.is_empty());
        assert_eq!(engine.state().phase, MatchPhase::Preparation);

        let second = engine.set_ready("b", Some(true)).unwrap();
        assert_eq!(second.events, vec![GameEvent::phase_changed(MatchPhase::Game)]);
        assert_eq!(engine.state().phase, MatchPhase::Game);
        assert_eq!(engine.state().current_player_id.as_deref(), Some("a"));
        assert!(engine.state().started_at.is_some());

        assert_eq!(engine.set_ready("a", None).unwrap_err(), Rejection::WrongPhase(MatchPhase::Game));
    }

    #[test]
    fn test_toggle_ready() {
        let m = open_match(&["a"], &["b"]);
        let mut engine = MatchEngine::new(m, Arc::new(catalog()), MatchTimings::default());
        engine.set_ready("a", None).unwrap();
        engine.set_ready("a", None).unwrap();
        assert!(!engine.state().player("a").unwrap().ready);
        assert!(engine.set_ready("ghost", None).is_err());
    }

    #[test]
    fn test_choose_start_position() {
        let m = open_match(&["a1", "a2"], &["b"]);
        let mut engine = MatchEngine::new(m, Arc::new(catalog()), MatchTimings::default());

        assert!(engine.choose_start_position("a1", Cell::new(0, 5)).is_ok());
        assert_eq!(engine.state().player("a1").unwrap().position, Cell::new(0, 5));

        // a2 stands on (0,1)
        assert_eq!(
            engine.choose_start_position("a1", Cell::new(0, 1)).unwrap_err(),
            Rejection::CellOccupied(Cell::new(0, 1))
        );
        assert_eq!(
            engine.choose_start_position("a1", Cell::new(9, 5)).unwrap_err(),
            Rejection::OutsideStartZone(Cell::new(9, 5))
        );
    }

    // Scenario A
    #[test]
    fn test_move_within_budget() {
        let mut engine = game_engine();
        place(&mut engine, "a", Cell::new(2, 2));

        let outcome = engine.request_movement("a", Cell::new(5, 2), None).unwrap();
        let a = engine.state().player("a").unwrap();
        assert_eq!(a.position, Cell::new(5, 2));
        assert_eq!(a.used_movement_points, 3);
        assert_eq!(a.last_path.len(), 4);
        assert!(matches!(
            outcome.deferred[0].action,
            DeferredAction::ClearPath { path_seq: 1, .. }
        ));
    }

    // Scenario B
    #[test]
    fn test_move_over_budget_rejected() {
        let mut engine = game_engine();
        place(&mut engine, "a", Cell::new(2, 2));

        let err = engine.request_movement("a", Cell::new(6, 2), None).unwrap_err();
        assert_eq!(err, Rejection::InsufficientMovement { cost: 4, remaining: 3 });
        let a = engine.state().player("a").unwrap();
        assert_eq!(a.position, Cell::new(2, 2));
        assert_eq!(a.used_movement_points, 0);
    }

    #[test]
    fn test_move_rejections() {
        let mut engine = game_engine();
        place(&mut engine, "a", Cell::new(2, 2));
        engine.state_mut().terrain.set_base_tile(Cell::new(3, 2), TileType::Water);

        assert_eq!(engine.request_movement("b", Cell::new(8, 0), None).unwrap_err(), Rejection::NotYourTurn);
        assert_eq!(
            engine.request_movement("a", Cell::new(3, 2), None).unwrap_err(),
            Rejection::NotWalkable(Cell::new(3, 2))
        );
        assert_eq!(
            engine.request_movement("a", Cell::new(2, 2), None).unwrap_err(),
            Rejection::AlreadyThere(Cell::new(2, 2))
        );
        // detour around the water costs 4
        assert_eq!(
            engine.request_movement("a", Cell::new(4, 2), None).unwrap_err(),
            Rejection::NoPath(Cell::new(4, 2))
        );
    }

    #[test]
    fn test_client_path_preferred_when_valid() {
        let mut engine = game_engine();
        place(&mut engine, "a", Cell::new(2, 2));
        let client = vec![Cell::new(2, 2), Cell::new(2, 3), Cell::new(3, 3)];
        engine.request_movement("a", Cell::new(3, 3), Some(client.clone())).unwrap();
        assert_eq!(engine.state().player("a").unwrap().last_path, client);

        // a gapped path falls back to A*
        place(&mut engine, "a", Cell::new(2, 2));
        engine.state_mut().player_mut("a").unwrap().used_movement_points = 0;
        let gapped = vec![Cell::new(2, 2), Cell::new(4, 2)];
        engine.request_movement("a", Cell::new(4, 2), Some(gapped)).unwrap();
        assert_eq!(engine.state().player("a").unwrap().last_path.len(), 3);
    }

    #[test]
    fn test_snare_after_full_move_keeps_budget_consistent() {
        let mut engine = game_engine();
        place(&mut engine, "a", Cell::new(2, 2));
        let snare = EntitySpec {
            entity_type: "snare".into(),
            health: None,
            duration: 0,
            trigger: Some(TriggerSpec::Movement),
            on_trigger: Deltas { movement: -2, ..Deltas::default() },
            on_death: None,
            blocks_movement: false,
            blocks_vision: false,
        };
        let mut report = EffectReport::default();
        let prov = Provenance { spell_id: "snare", caster_id: "b" };
        spawn_entity(engine.state_mut(), Cell::new(2, 5), &snare, prov, &mut report).unwrap();

        engine.request_movement("a", Cell::new(2, 5), None).unwrap();
        let a = engine.state().player("a").unwrap();
        assert_eq!(a.used_movement_points, 3);
        assert!(a.used_movement_points <= a.movement_points);
        assert_eq!(a.remaining_movement(), 0);
        assert!(engine.state().entities.is_empty());
    }

    #[test]
    fn test_clear_path_respects_sequence() {
        let mut engine = game_engine();
        place(&mut engine, "a", Cell::new(2, 2));
        let first = engine.request_movement("a", Cell::new(3, 2), None).unwrap();
        engine.request_movement("a", Cell::new(4, 2), None).unwrap();

        let stale = first.deferred[0].clone();
        assert_eq!(engine.apply_deferred(stale.action, stale.token).unwrap_err(), Rejection::Stale);
        assert!(!engine.state().player("a").unwrap().last_path.is_empty());
    }

    // Scenario C
    #[test]
    fn test_cast_damages_and_schedules_hit() {
        let mut engine = game_engine();
        place(&mut engine, "a", Cell::new(2, 2));
        place(&mut engine, "b", Cell::new(6, 2));
        engine.state_mut().player_mut("a").unwrap().energy = 3;

        let outcome = engine.cast_spell("a", "arcane_bolt", vec![Cell::new(6, 2)]).unwrap();
        let state = engine.state();
        assert_eq!(state.player("a").unwrap().energy, 0);
        let b = state.player("b").unwrap();
        assert_eq!(b.health, b.max_health - 5);

        assert!(matches!(outcome.events[0], GameEvent::SpellCast { .. }));
        assert_eq!(outcome.deferred.len(), 1);
        assert_eq!(outcome.deferred[0].delay_ms, 600);
        let hit = outcome.deferred[0].clone();
        let fired = engine.apply_deferred(hit.action, hit.token).unwrap();
        assert_eq!(fired.events, vec![GameEvent::SpellHit {
            target_user_id: "b".into(),
            caster_user_id: "a".into(),
            spell_id: "arcane_bolt".into(),
        }]);
    }

    #[test]
    fn test_cast_validation_pipeline() {
        let mut engine = game_engine();
        place(&mut engine, "a", Cell::new(2, 2));
        place(&mut engine, "b", Cell::new(6, 2));

        assert_eq!(
            engine.cast_spell("a", "nope", vec![Cell::new(4, 2)]).unwrap_err(),
            Rejection::UnknownSpell("nope".into())
        );
        engine.state_mut().player_mut("a").unwrap().spell_loadout.retain(|s| s != "blink");
        assert_eq!(
            engine.cast_spell("a", "blink", vec![Cell::new(3, 2)]).unwrap_err(),
            Rejection::NotInLoadout("blink".into())
        );
        assert_eq!(
            engine.cast_spell("a", "arcane_bolt", vec![Cell::new(3, 2)]).unwrap_err(),
            Rejection::OutOfRange { cell: Cell::new(3, 2), distance: 1 }
        );
        assert_eq!(
            engine.cast_spell("a", "arcane_bolt", vec![]).unwrap_err(),
            Rejection::BadTargetCount { given: 0, max: 1 }
        );

        engine.state_mut().terrain.set_base_tile(Cell::new(4, 2), TileType::Wall);
        assert_eq!(
            engine.cast_spell("a", "arcane_bolt", vec![Cell::new(6, 2)]).unwrap_err(),
            Rejection::NoLineOfSight(Cell::new(6, 2))
        );
        assert_eq!(
            engine.cast_spell("a", "arcane_bolt", vec![Cell::new(4, 2)]).unwrap_err(),
            Rejection::InvalidTarget(Cell::new(4, 2))
        );

        engine.state_mut().player_mut("a").unwrap().energy = 2;
        assert_eq!(
            engine.cast_spell("a", "arcane_bolt", vec![Cell::new(2, 5)]).unwrap_err(),
            Rejection::InsufficientEnergy { cost: 3, energy: 2 }
        );
        let b = engine.state().player("b").unwrap();
        assert_eq!(b.health, b.max_health);
    }

    #[test]
    fn test_unit_target_respects_invisibility() {
        let mut engine = game_engine();
        place(&mut engine, "a", Cell::new(2, 2));
        place(&mut engine, "b", Cell::new(5, 2));
        engine.state_mut().player_mut("b").unwrap().invisibility = Some(Invisibility {
            source_effect_id: "shroud".into(),
            remaining: 2,
        });
        assert_eq!(
            engine.cast_spell("a", "mark", vec![Cell::new(5, 2)]).unwrap_err(),
            Rejection::InvalidTarget(Cell::new(5, 2))
        );
        engine.state_mut().player_mut("b").unwrap().invisibility = None;
        assert!(engine.cast_spell("a", "mark", vec![Cell::new(5, 2)]).is_ok());
    }

    // Scenario D
    #[test]
    fn test_third_earth_block_replaces_oldest() {
        let mut engine = game_engine();
        place(&mut engine, "a", Cell::new(2, 2));
        for y in [1, 2, 3] {
            engine.cast_spell("a", "earth_wall", vec![Cell::new(4, y)]).unwrap();
        }
        let positions: Vec<Cell> = engine.state().entities.values().map(|e| e.position).collect();
        assert_eq!(positions, vec![Cell::new(4, 2), Cell::new(4, 3)]);
    }

    #[test]
    fn test_teleport_is_deferred_and_revalidated() {
        let mut engine = game_engine();
        place(&mut engine, "a", Cell::new(2, 2));
        let outcome = engine.cast_spell("a", "blink", vec![Cell::new(4, 2)]).unwrap();
        assert_eq!(engine.state().player("a").unwrap().position, Cell::new(2, 2));

        let commit = outcome.deferred[0].clone();
        let fired = engine.apply_deferred(commit.action, commit.token).unwrap();
        assert_eq!(fired.events, vec![GameEvent::TeleportConfirm { user_id: "a".into(), destination: Cell::new(4, 2) }]);
        assert_eq!(engine.state().player("a").unwrap().position, Cell::new(4, 2));

        // destination taken before the commit fires
        let outcome = engine.cast_spell("a", "blink", vec![Cell::new(6, 2)]).unwrap();
        place(&mut engine, "b", Cell::new(6, 2));
        let commit = outcome.deferred[0].clone();
        assert_eq!(
            engine.apply_deferred(commit.action, commit.token).unwrap_err(),
            Rejection::CellOccupied(Cell::new(6, 2))
        );
        assert_eq!(engine.state().player("a").unwrap().position, Cell::new(4, 2));
    }

    #[test]
    fn test_prep_and_cancel() {
        let mut engine = game_engine();
        assert_eq!(engine.cancel_spell_prep("a").unwrap_err(), Rejection::NothingPrepared);
        let prep = engine.prepare_spell("a", "arcane_bolt").unwrap();
        assert!(matches!(prep.events[0], GameEvent::SpellPrep { .. }));
        assert!(engine.prepare_spell("b", "arcane_bolt").is_err());

        // ending the turn closes the presentation
        let end = engine.end_turn("a").unwrap();
        assert_eq!(end.events, vec![GameEvent::prep_cancelled("a")]);
        assert!(engine.state().spell_prep.is_empty());
    }

    #[test]
    fn test_end_turn_refills_next_player() {
        let mut engine = game_engine();
        engine.state_mut().player_mut("b").unwrap().energy = 0;
        engine.end_turn("a").unwrap();
        let state = engine.state();
        assert_eq!(state.current_player_id.as_deref(), Some("b"));
        assert_eq!(state.turn, 2);
        assert_eq!(state.player("b").unwrap().energy, state.player("b").unwrap().max_energy);
        assert_eq!(engine.end_turn("a").unwrap_err(), Rejection::NotYourTurn);
    }

    #[test]
    fn test_orientation_normalized_any_phase() {
        let m = open_match(&["a"], &["b"]);
        let mut engine = MatchEngine::new(m, Arc::new(catalog()), MatchTimings::default());
        engine.update_orientation("a", 3.0 * std::f64::consts::PI).unwrap();
        let o = engine.state().player("a").unwrap().orientation;
        assert!((o - std::f64::consts::PI).abs() < 1e-9);
    }

    #[test]
    fn test_end_game_invalidates_pending_actions() {
        let mut engine = game_engine();
        place(&mut engine, "a", Cell::new(2, 2));
        place(&mut engine, "b", Cell::new(6, 2));
        let cast = engine.cast_spell("a", "arcane_bolt", vec![Cell::new(6, 2)]).unwrap();

        let end = engine.end_game(Team::A).unwrap();
        assert_eq!(engine.state().phase, MatchPhase::Stats);
        assert_eq!(engine.state().stats.as_ref().unwrap().winner, Some(Team::A));

        let hit = cast.deferred[0].clone();
        assert_eq!(engine.apply_deferred(hit.action, hit.token).unwrap_err(), Rejection::Stale);

        let dispose = end.deferred[0].clone();
        assert_eq!(dispose.delay_ms, MatchTimings::default().stats_dispose_delay_ms);
        assert!(engine.apply_deferred(dispose.action, dispose.token).unwrap().dispose);
        assert!(engine.end_game(Team::B).is_err());
    }

    proptest! {
        #[test]
        fn prop_turns_cycle(team_a in 1usize..4, team_b in 1usize..4, rounds in 1usize..4) {
            let a_ids: Vec<String> = (0..team_a).map(|i| format!("a{}", i)).collect();
            let b_ids: Vec<String> = (0..team_b).map(|i| format!("b{}", i)).collect();
            let a_refs: Vec<&str> = a_ids.iter().map(String::as_str).collect();
            let b_refs: Vec<&str> = b_ids.iter().map(String::as_str).collect();
            let m = open_match(&a_refs, &b_refs);
            let mut engine = MatchEngine::new(m, Arc::new(catalog()), MatchTimings::default());
            let ids: Vec<String> = engine.state().turn_order.clone();
            for id in &ids {
                engine.set_ready(id, Some(true)).unwrap();
            }
            let first = engine.state().current_player_id.clone();
            for _ in 0..rounds * ids.len() {
                let current = engine.state().current_player_id.clone().unwrap();
                prop_assert!(engine.state().turn_order.contains(&current));
                engine.end_turn(&current).unwrap();
            }
            prop_assert_eq!(engine.state().current_player_id.clone(), first);
        }

        #[test]
        fn prop_cast_never_outside_range(x in 0i32..10, y in 0i32..10) {
            let mut engine = game_engine();
            place(&mut engine, "a", Cell::new(2, 2));
            let target = Cell::new(x, y);
            let distance = Cell::new(2, 2).manhattan(target);
            let result = engine.cast_spell("a", "arcane_bolt", vec![target]);
            if result.is_ok() {
                prop_assert!((2..=6).contains(&distance));
            }
        }

        #[test]
        fn prop_movement_never_exceeds_budget(x in 0i32..10, y in 0i32..10) {
            let mut engine = game_engine();
            place(&mut engine, "a", Cell::new(4, 4));
            let before = engine.state().player("a").unwrap().remaining_movement();
            if engine.request_movement("a", Cell::new(x, y), None).is_ok() {
                let a = engine.state().player("a").unwrap();
                prop_assert!(a.used_movement_points <= before);
                prop_assert!(a.used_movement_points <= a.movement_points);
            }
        }
    }
}
