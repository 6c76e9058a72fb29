//! Turn Ticking
//!
//! Everything that happens because time passed rather than because a player
//! acted: start-of-turn and end-of-turn processing for one player, and the
//! global per-turn countdown of field records.
//!
//! Terrain always reverts on schedule. Whoever stands on a cell that turns
//! unwalkable is pushed to the nearest free cell.
//!
//! Records that fail an integrity check (out-of-bounds cell, zero stacks,
//! entity health above its max) are logged and dropped as if they had
//! expired. One bad record never stops the tick.

use tracing::warn;

use crate::core::grid::Cell;
use crate::game::effects::kill_entity;
use crate::game::spell::{Deltas, TriggerSpec};
use crate::game::state::{EntityId, Match};

/// What a tick changed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickResult {
    /// Statuses that expired, as (user, effect id).
    pub expired_statuses: Vec<(String, String)>,
    /// Ground effect cells that expired.
    pub expired_ground: Vec<Cell>,
    /// Terrain cells that reverted.
    pub reverted_cells: Vec<Cell>,
    /// Entities that fired a trigger.
    pub triggered_entities: Vec<EntityId>,
    /// Entities that ran out of time or stood on a reverted cell.
    pub expired_entities: Vec<EntityId>,
    /// Players pushed off a reverted cell, with where they landed.
    pub displaced: Vec<(String, Cell)>,
    /// Records dropped by integrity checks.
    pub discarded: usize,
}

// =============================================================================
// PER-PLAYER TICKS
// =============================================================================

/// Start-of-turn processing for the player whose turn just began.
///
/// 1. Refill energy and movement, reset spent movement
/// 2. Status ticks (scaled by stacks), then countdown and expiry
/// 3. Ground effect under the player
/// 4. Invisibility countdown
pub fn begin_turn(m: &mut Match, user_id: &str) -> TickResult {
    let mut result = TickResult::default();
    let Some(position) = m.player(user_id).map(|p| p.position) else {
        return result;
    };
    let ground = m.ground_effects.get(&position).map(|g| g.on_turn_start);
    let Some(player) = m.players.get_mut(user_id) else {
        return result;
    };

    player.energy = player.max_energy;
    player.movement_points = player.max_movement_points;
    player.used_movement_points = 0;

    let effect_ids: Vec<String> = player.status_effects.keys().cloned().collect();
    for effect_id in effect_ids {
        let Some(status) = player.status_effects.get_mut(&effect_id) else {
            continue;
        };
        if status.stacks == 0 {
            warn!(user_id, effect_id = %effect_id, "dropping status with zero stacks");
            player.status_effects.remove(&effect_id);
            result.discarded += 1;
            continue;
        }

        let tick = status.on_turn_start.scaled(status.stacks);
        status.duration = status.duration.saturating_sub(1);
        let expired = status.duration == 0;
        player.apply_deltas(tick);

        if expired {
            if let Some(status) = player.status_effects.remove(&effect_id) {
                player.apply_deltas(status.on_remove);
                if status.grants_invisibility
                    && player.invisibility.as_ref().is_some_and(|i| i.source_effect_id == effect_id)
                {
                    player.invisibility = None;
                }
            }
            result.expired_statuses.push((user_id.to_string(), effect_id));
        }
    }

    if let Some(deltas) = ground {
        player.apply_deltas(deltas);
    }

    if let Some(inv) = player.invisibility.as_mut() {
        inv.remaining = inv.remaining.saturating_sub(1);
        if inv.remaining == 0 {
            player.invisibility = None;
        }
    }

    result
}

/// End-of-turn processing for the player whose turn is ending.
pub fn finish_turn(m: &mut Match, user_id: &str) {
    let Some(player) = m.players.get_mut(user_id) else {
        return;
    };
    let ticks: Vec<Deltas> = player
        .status_effects
        .values()
        .filter(|s| s.stacks > 0)
        .map(|s| s.on_turn_end.scaled(s.stacks))
        .collect();
    for deltas in ticks {
        player.apply_deltas(deltas);
    }
    player.used_movement_points = 0;
    player.movement_points = player.movement_points.min(player.max_movement_points);
    player.stats.turns_played += 1;
}

// =============================================================================
// GLOBAL TICK
// =============================================================================

/// Count every ground effect, terrain modification and entity down by one
/// turn. Proximity triggers resolve before entity countdown.
pub fn global_tick(m: &mut Match) -> TickResult {
    let mut result = TickResult::default();
    tick_ground_effects(m, &mut result);
    tick_terrain(m, &mut result);
    resolve_proximity_triggers(m, &mut result);
    tick_entities(m, &mut result);
    result
}

fn tick_ground_effects(m: &mut Match, result: &mut TickResult) {
    let cells: Vec<Cell> = m.ground_effects.keys().copied().collect();
    for cell in cells {
        if !m.terrain.in_bounds(cell) {
            warn!(%cell, "dropping out-of-bounds ground effect");
            m.ground_effects.remove(&cell);
            result.discarded += 1;
            continue;
        }
        let Some(effect) = m.ground_effects.get_mut(&cell) else {
            continue;
        };
        if effect.duration == 0 {
            continue;
        }
        effect.duration -= 1;
        if effect.duration == 0 {
            m.ground_effects.remove(&cell);
            result.expired_ground.push(cell);
        }
    }
}

fn tick_terrain(m: &mut Match, result: &mut TickResult) {
    let cells: Vec<Cell> = m.terrain_modifications.keys().copied().collect();
    for cell in cells {
        if !m.terrain.in_bounds(cell) {
            warn!(%cell, "dropping out-of-bounds terrain modification");
            m.terrain_modifications.remove(&cell);
            result.discarded += 1;
            continue;
        }
        let Some(modification) = m.terrain_modifications.get_mut(&cell) else {
            continue;
        };
        if modification.is_permanent() {
            continue;
        }
        modification.duration -= 1;
        if modification.duration > 0 {
            continue;
        }
        let original = modification.original_type;
        m.terrain_modifications.remove(&cell);
        result.reverted_cells.push(cell);
        if !original.is_walkable() {
            evict_from_reverted(m, cell, result);
        }
    }
}

/// Clear a cell that just turned unwalkable: players step to the nearest
/// free cell, entities are destroyed.
fn evict_from_reverted(m: &mut Match, cell: Cell, result: &mut TickResult) {
    let entity_ids: Vec<EntityId> = m.entities.values().filter(|e| e.position == cell).map(|e| e.id).collect();
    for id in entity_ids {
        kill_entity(m, id);
        result.expired_entities.push(id);
    }

    let Some(user_id) = m.unit_at(cell).map(|p| p.user_id.clone()) else {
        return;
    };
    match nearest_free_cell(m, cell, &user_id) {
        Some(free) => {
            if let Some(player) = m.players.get_mut(&user_id) {
                player.position = free;
            }
            result.displaced.push((user_id, free));
        }
        None => warn!(%cell, user = %user_id, "no free cell to displace player onto"),
    }
}

/// Closest walkable, unblocked cell by Manhattan distance, row-major on ties.
fn nearest_free_cell(m: &Match, from: Cell, user_id: &str) -> Option<Cell> {
    let view = m.terrain_view();
    let max_radius = (m.terrain.width() + m.terrain.height()).max(0) as u32;
    (1..=max_radius).find_map(|radius| {
        let mut ring: Vec<Cell> = from
            .manhattan_area(radius)
            .into_iter()
            .filter(|c| c.manhattan(from) == radius)
            .collect();
        ring.sort_unstable();
        ring.into_iter()
            .find(|c| view.is_walkable(*c) && !m.is_occupied(*c) && !m.blocks_movement(*c, user_id))
    })
}

fn resolve_proximity_triggers(m: &mut Match, result: &mut TickResult) {
    let armed: Vec<(EntityId, Cell, u32)> = m
        .entities
        .values()
        .filter_map(|e| match e.trigger {
            Some(TriggerSpec::Proximity { radius }) => Some((e.id, e.position, radius)),
            _ => None,
        })
        .collect();

    for (id, position, radius) in armed {
        let Some(entity) = m.entities.get(&id) else {
            continue;
        };
        let owner_team = entity.owner_team;
        let deltas = entity.on_trigger;
        let victims: Vec<String> = m
            .players
            .values()
            .filter(|p| p.team != owner_team && p.position.manhattan(position) <= radius)
            .map(|p| p.user_id.clone())
            .collect();
        if victims.is_empty() {
            continue;
        }
        for victim in &victims {
            if let Some(player) = m.players.get_mut(victim) {
                player.apply_deltas(deltas);
            }
        }
        m.entities.remove(&id);
        result.triggered_entities.push(id);
    }
}

fn tick_entities(m: &mut Match, result: &mut TickResult) {
    let ids: Vec<EntityId> = m.entities.keys().copied().collect();
    for id in ids {
        let Some(entity) = m.entities.get_mut(&id) else {
            continue;
        };
        let corrupt = !m.terrain.in_bounds(entity.position)
            || matches!((entity.health, entity.max_health), (Some(h), Some(max)) if h > max)
            || (entity.health.is_some() && entity.max_health.is_none());
        if corrupt {
            warn!(entity_id = id, position = %entity.position, "dropping corrupt entity");
            m.entities.remove(&id);
            result.discarded += 1;
            continue;
        }
        if entity.duration == 0 {
            continue;
        }
        entity.duration -= 1;
        if entity.duration == 0 {
            kill_entity(m, id);
            result.expired_entities.push(id);
        }
    }
}

// =============================================================================
// MOVEMENT TRIGGERS
// =============================================================================

/// Fire opposing movement-trigger entities on the cells a mover entered.
///
/// Each trap fires once and is consumed. Returns the fired entity ids.
pub fn fire_movement_triggers(m: &mut Match, mover_id: &str, entered: &[Cell]) -> Vec<EntityId> {
    let Some(team) = m.team_of(mover_id) else {
        return Vec::new();
    };
    let traps: Vec<(EntityId, Deltas)> = m
        .entities
        .values()
        .filter(|e| e.owner_team != team)
        .filter(|e| matches!(e.trigger, Some(TriggerSpec::Movement)))
        .filter(|e| entered.contains(&e.position))
        .map(|e| (e.id, e.on_trigger))
        .collect();

    let mut fired = Vec::with_capacity(traps.len());
    for (id, deltas) in traps {
        if let Some(player) = m.players.get_mut(mover_id) {
            player.apply_deltas(deltas);
        }
        m.entities.remove(&id);
        fired.push(id);
    }
    fired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::effects::{spawn_entity, stamp_ground_effect, change_terrain, EffectReport, Provenance};
    use crate::game::spell::{AreaDeltas, EntitySpec, GroundEffectSpec, TerrainChangeSpec};
    use crate::game::state::tests::open_match;
    use crate::game::state::StatusEffectInstance;
    use crate::game::terrain::TileType;
    use proptest::prelude::*;

    fn prov<'a>() -> Provenance<'a> {
        Provenance { spell_id: "s", caster_id: "a" }
    }

    fn poison(stacks: u32, duration: u32) -> StatusEffectInstance {
        StatusEffectInstance {
            effect_id: "poison".into(),
            source_spell_id: "venom".into(),
            source_user_id: "a".into(),
            duration,
            stacks,
            max_stacks: 3,
            stackable: true,
            on_apply: Deltas::default(),
            on_turn_start: Deltas { health: -2, ..Deltas::default() },
            on_turn_end: Deltas::default(),
            on_remove: Deltas { energy: -1, ..Deltas::default() },
            grants_invisibility: false,
            reveals_invisibility: false,
        }
    }

    #[test]
    fn test_begin_turn_scales_and_expires_status() {
        let mut m = open_match(&["a"], &["b"]);
        m.player_mut("b").unwrap().status_effects.insert("poison".into(), poison(3, 2));

        let first = begin_turn(&mut m, "b");
        let b = m.player("b").unwrap();
        assert_eq!(b.health, b.max_health - 6);
        assert_eq!(b.status_effects["poison"].duration, 1);
        assert!(first.expired_statuses.is_empty());

        let second = begin_turn(&mut m, "b");
        let b = m.player("b").unwrap();
        assert_eq!(b.health, b.max_health - 12);
        assert!(b.status_effects.is_empty());
        // on_remove lands after the energy refill
        assert_eq!(b.energy, b.max_energy - 1);
        assert_eq!(second.expired_statuses, vec![("b".to_string(), "poison".to_string())]);
    }

    #[test]
    fn test_zero_stack_status_discarded() {
        let mut m = open_match(&["a"], &["b"]);
        m.player_mut("b").unwrap().status_effects.insert("poison".into(), poison(0, 2));
        let result = begin_turn(&mut m, "b");
        assert_eq!(result.discarded, 1);
        let b = m.player("b").unwrap();
        assert!(b.status_effects.is_empty());
        assert_eq!(b.health, b.max_health);
    }

    #[test]
    fn test_finish_turn_clamps_movement() {
        let mut m = open_match(&["a"], &["b"]);
        let a = m.player_mut("a").unwrap();
        a.movement_points = a.max_movement_points + 4;
        a.used_movement_points = 2;
        finish_turn(&mut m, "a");
        let a = m.player("a").unwrap();
        assert_eq!(a.movement_points, a.max_movement_points);
        assert_eq!(a.used_movement_points, 0);
        assert_eq!(a.stats.turns_played, 1);
    }

    #[test]
    fn test_ground_effect_expires_on_schedule() {
        let mut m = open_match(&["a"], &["b"]);
        let spec = GroundEffectSpec {
            effect_id: "fire".into(),
            radius: 0,
            duration: 2,
            on_enter: Deltas::default(),
            on_turn_start: Deltas::default(),
            blocks_movement: false,
            blocks_vision: false,
        };
        stamp_ground_effect(&mut m, Cell::new(4, 4), &spec, prov());
        global_tick(&mut m);
        assert_eq!(m.ground_effects[&Cell::new(4, 4)].duration, 1);
        let result = global_tick(&mut m);
        assert!(m.ground_effects.is_empty());
        assert_eq!(result.expired_ground, vec![Cell::new(4, 4)]);
    }

    #[test]
    fn test_permanent_records_never_tick() {
        let mut m = open_match(&["a"], &["b"]);
        let spec = TerrainChangeSpec { from_type: TileType::Ground, to_type: TileType::Water, radius: 0, duration: 0 };
        change_terrain(&mut m, Cell::new(4, 4), &spec, prov());
        for _ in 0..10 {
            global_tick(&mut m);
        }
        assert!(!m.terrain_view().is_walkable(Cell::new(4, 4)));
    }

    #[test]
    fn test_terrain_reverts_on_schedule_and_displaces() {
        let mut m = open_match(&["a"], &["b"]);
        m.terrain.set_base_tile(Cell::new(4, 4), TileType::Wall);
        let spec = TerrainChangeSpec { from_type: TileType::Wall, to_type: TileType::Ground, radius: 0, duration: 2 };
        change_terrain(&mut m, Cell::new(4, 4), &spec, prov());
        assert!(m.terrain_view().is_walkable(Cell::new(4, 4)));

        m.player_mut("a").unwrap().position = Cell::new(4, 4);
        let first = global_tick(&mut m);
        assert!(first.reverted_cells.is_empty());
        assert_eq!(m.terrain_modifications[&Cell::new(4, 4)].duration, 1);

        let second = global_tick(&mut m);
        assert_eq!(second.reverted_cells, vec![Cell::new(4, 4)]);
        assert!(m.terrain_modifications.is_empty());
        assert!(!m.terrain_view().is_walkable(Cell::new(4, 4)));
        // (4,3) is the first free cell at distance 1 in row-major order
        assert_eq!(second.displaced, vec![("a".to_string(), Cell::new(4, 3))]);
        assert_eq!(m.player("a").unwrap().position, Cell::new(4, 3));
    }

    #[test]
    fn test_reverted_cell_destroys_entity() {
        let mut m = open_match(&["a"], &["b"]);
        let mut report = EffectReport::default();
        m.terrain.set_base_tile(Cell::new(6, 6), TileType::Water);
        let spec = TerrainChangeSpec { from_type: TileType::Water, to_type: TileType::Ground, radius: 0, duration: 1 };
        change_terrain(&mut m, Cell::new(6, 6), &spec, prov());
        let totem = EntitySpec {
            entity_type: "totem".into(),
            health: Some(5),
            duration: 0,
            trigger: None,
            on_trigger: Deltas::default(),
            on_death: None,
            blocks_movement: true,
            blocks_vision: false,
        };
        let id = spawn_entity(&mut m, Cell::new(6, 6), &totem, prov(), &mut report).unwrap();

        let result = global_tick(&mut m);
        assert_eq!(result.expired_entities, vec![id]);
        assert!(m.entities.is_empty());
    }

    #[test]
    fn test_proximity_trigger_and_expiry_burst() {
        let mut m = open_match(&["a"], &["b"]);
        let mut report = EffectReport::default();
        let b_cell = m.player("b").unwrap().position;

        let mine = EntitySpec {
            entity_type: "mine".into(),
            health: None,
            duration: 5,
            trigger: Some(TriggerSpec::Proximity { radius: 1 }),
            on_trigger: Deltas { health: -7, ..Deltas::default() },
            on_death: None,
            blocks_movement: false,
            blocks_vision: false,
        };
        let id = spawn_entity(&mut m, b_cell.offset(0, 1), &mine, prov(), &mut report).unwrap();

        let bomb = EntitySpec {
            entity_type: "bomb".into(),
            health: None,
            duration: 1,
            trigger: None,
            on_trigger: Deltas::default(),
            on_death: Some(AreaDeltas { radius: 2, deltas: Deltas { health: -3, ..Deltas::default() } }),
            blocks_movement: true,
            blocks_vision: false,
        };
        let bomb_id = spawn_entity(&mut m, b_cell.offset(-2, 0), &bomb, prov(), &mut report).unwrap();

        let result = global_tick(&mut m);
        assert_eq!(result.triggered_entities, vec![id]);
        assert_eq!(result.expired_entities, vec![bomb_id]);
        assert!(m.entities.is_empty());
        let b = m.player("b").unwrap();
        assert_eq!(b.health, b.max_health - 10);
    }

    #[test]
    fn test_movement_trap_fires_for_enemy_only() {
        let mut m = open_match(&["a"], &["b"]);
        let mut report = EffectReport::default();
        let trap = EntitySpec {
            entity_type: "snare".into(),
            health: None,
            duration: 0,
            trigger: Some(TriggerSpec::Movement),
            on_trigger: Deltas { movement: -2, health: -1, energy: 0 },
            on_death: None,
            blocks_movement: false,
            blocks_vision: false,
        };
        let id = spawn_entity(&mut m, Cell::new(5, 5), &trap, prov(), &mut report).unwrap();

        assert!(fire_movement_triggers(&mut m, "a", &[Cell::new(5, 5)]).is_empty());
        assert_eq!(fire_movement_triggers(&mut m, "b", &[Cell::new(5, 4), Cell::new(5, 5)]), vec![id]);
        assert!(m.entities.is_empty());
        assert_eq!(m.player("b").unwrap().health, m.player("b").unwrap().max_health - 1);
    }

    #[test]
    fn test_corrupt_entity_discarded() {
        let mut m = open_match(&["a"], &["b"]);
        let mut report = EffectReport::default();
        let spec = EntitySpec {
            entity_type: "wall".into(),
            health: Some(5),
            duration: 0,
            trigger: None,
            on_trigger: Deltas::default(),
            on_death: None,
            blocks_movement: true,
            blocks_vision: true,
        };
        let id = spawn_entity(&mut m, Cell::new(3, 3), &spec, prov(), &mut report).unwrap();
        m.entities.get_mut(&id).unwrap().health = Some(50);
        let result = global_tick(&mut m);
        assert_eq!(result.discarded, 1);
        assert!(m.entities.is_empty());
    }

    proptest! {
        #[test]
        fn prop_durations_drop_by_one(duration in 1u32..8, ticks in 0u32..8) {
            let mut m = open_match(&["a"], &["b"]);
            let spec = GroundEffectSpec {
                effect_id: "fog".into(),
                radius: 0,
                duration,
                on_enter: Deltas::default(),
                on_turn_start: Deltas::default(),
                blocks_movement: false,
                blocks_vision: true,
            };
            stamp_ground_effect(&mut m, Cell::new(5, 5), &spec, prov());
            for _ in 0..ticks {
                global_tick(&mut m);
            }
            match m.ground_effects.get(&Cell::new(5, 5)) {
                Some(effect) => prop_assert_eq!(effect.duration, duration - ticks),
                None => prop_assert!(ticks >= duration),
            }
        }
    }
}
