//! Effect Engine
//!
//! One pure function per effect kind, each operating on the match aggregate
//! with an already-resolved target set. Validation (range, line of sight,
//! energy) happens before any of these run; the functions here only enforce
//! the per-effect rules (clamping, stacking, spawn placement).

use tracing::warn;

use crate::core::grid::Cell;
use crate::game::spell::{
    Deltas, EntitySpec, GroundEffectSpec, SpellEffect, StatusEffectSpec, TerrainChangeSpec,
};
use crate::game::state::{
    EntityId, GroundEffectInstance, Invisibility, Match, SpawnedEntity, StatusEffectInstance,
    TerrainModification, UserId,
};
use crate::game::terrain::TileType;

/// Entity type subject to the per-owner cap.
pub const EARTH_BLOCK: &str = "earth_block";

/// How many earth blocks one owner may hold at once.
pub const MAX_EARTH_BLOCKS_PER_OWNER: usize = 2;

/// Who caused an effect.
#[derive(Clone, Copy, Debug)]
pub struct Provenance<'a> {
    /// Spell being resolved.
    pub spell_id: &'a str,
    /// Caster.
    pub caster_id: &'a str,
}

/// Resolved target for one entry of a cast.
#[derive(Clone, Debug, Default)]
pub struct ResolvedTarget {
    /// Target cell.
    pub cell: Cell,
    /// Pattern cells around it.
    pub area: Vec<Cell>,
    /// Units that pass the spell's filters.
    pub units: Vec<UserId>,
    /// Damageable entities that pass the spell's filters.
    pub entities: Vec<EntityId>,
}

/// What happened while applying effects.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EffectReport {
    /// Units that lost health.
    pub damaged: Vec<UserId>,
    /// Entities destroyed.
    pub killed_entities: Vec<EntityId>,
    /// Entities created.
    pub spawned: Vec<EntityId>,
    /// Entities removed to make room under the per-owner cap.
    pub evicted: Vec<EntityId>,
    /// Caster relocation requested by a teleport effect.
    pub teleport: Option<Cell>,
}

impl EffectReport {
    fn note_damaged(&mut self, user_id: &str) {
        if !self.damaged.iter().any(|u| u == user_id) {
            self.damaged.push(user_id.to_string());
        }
    }
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Apply one declared effect to a resolved target.
pub fn apply_effect(
    m: &mut Match,
    effect: &SpellEffect,
    target: &ResolvedTarget,
    prov: Provenance<'_>,
    report: &mut EffectReport,
) {
    match effect {
        SpellEffect::Damage { amount, .. } => {
            damage(m, &target.units, *amount, prov, report);
            damage_entities(m, &target.entities, *amount, report);
        }
        SpellEffect::Heal { amount } => heal(m, &target.units, *amount, prov),
        SpellEffect::Movement { amount } => grant_movement(m, &target.units, *amount),
        SpellEffect::Teleport => report.teleport = Some(target.cell),
        SpellEffect::StatusEffect(spec) => apply_status(m, &target.units, spec, prov),
        SpellEffect::GroundEffect(spec) => stamp_ground_effect(m, target.cell, spec, prov),
        SpellEffect::TerrainChange(spec) => change_terrain(m, target.cell, spec, prov),
        SpellEffect::SpawnEntity(spec) => {
            spawn_entity(m, target.cell, spec, prov, report);
        }
    }
}

// =============================================================================
// UNIT EFFECTS
// =============================================================================

/// Remove health, clamped at 0.
pub fn damage(m: &mut Match, targets: &[UserId], amount: u32, prov: Provenance<'_>, report: &mut EffectReport) {
    let mut dealt = 0u32;
    for id in targets {
        let Some(player) = m.players.get_mut(id) else {
            continue;
        };
        let change = player.apply_deltas(Deltas { health: -(amount.min(i32::MAX as u32) as i32), ..Deltas::default() });
        if change < 0 {
            if id != prov.caster_id {
                dealt = dealt.saturating_add(change.unsigned_abs());
            }
            report.note_damaged(id);
        }
    }
    if let Some(caster) = m.players.get_mut(prov.caster_id) {
        caster.stats.damage_dealt = caster.stats.damage_dealt.saturating_add(dealt);
    }
}

/// Restore health, clamped at max.
pub fn heal(m: &mut Match, targets: &[UserId], amount: u32, prov: Provenance<'_>) {
    let mut healed = 0u32;
    for id in targets {
        let Some(player) = m.players.get_mut(id) else {
            continue;
        };
        let change = player.apply_deltas(Deltas { health: amount.min(i32::MAX as u32) as i32, ..Deltas::default() });
        healed = healed.saturating_add(change.max(0) as u32);
    }
    if let Some(caster) = m.players.get_mut(prov.caster_id) {
        caster.stats.healing_done = caster.stats.healing_done.saturating_add(healed);
    }
}

/// Add movement points. The total may exceed the max until the bearer's
/// turn ends.
pub fn grant_movement(m: &mut Match, targets: &[UserId], amount: i32) {
    for id in targets {
        if let Some(player) = m.players.get_mut(id) {
            player.apply_deltas(Deltas { movement: amount, ..Deltas::default() });
        }
    }
}

/// Create, refresh or stack a status effect.
pub fn apply_status(m: &mut Match, targets: &[UserId], spec: &StatusEffectSpec, prov: Provenance<'_>) {
    for id in targets {
        let Some(player) = m.players.get_mut(id) else {
            continue;
        };

        if let Some(existing) = player.status_effects.get_mut(&spec.effect_id) {
            if existing.stackable {
                existing.stacks = (existing.stacks + 1).min(existing.max_stacks.max(1));
            }
            existing.duration = existing.duration.max(spec.duration);
            if existing.grants_invisibility {
                let remaining = existing.duration;
                if let Some(inv) = player.invisibility.as_mut().filter(|i| i.source_effect_id == spec.effect_id) {
                    inv.remaining = inv.remaining.max(remaining);
                }
            }
            continue;
        }

        player.status_effects.insert(spec.effect_id.clone(), StatusEffectInstance {
            effect_id: spec.effect_id.clone(),
            source_spell_id: prov.spell_id.to_string(),
            source_user_id: prov.caster_id.to_string(),
            duration: spec.duration,
            stacks: 1,
            max_stacks: if spec.stackable { spec.max_stacks.max(1) } else { 1 },
            stackable: spec.stackable,
            on_apply: spec.on_apply,
            on_turn_start: spec.on_turn_start,
            on_turn_end: spec.on_turn_end,
            on_remove: spec.on_remove,
            grants_invisibility: spec.grants_invisibility,
            reveals_invisibility: spec.reveals_invisibility,
        });
        player.apply_deltas(spec.on_apply);
        if spec.grants_invisibility {
            player.invisibility = Some(Invisibility {
                source_effect_id: spec.effect_id.clone(),
                remaining: spec.duration,
            });
        }
    }
}

// =============================================================================
// FIELD EFFECTS
// =============================================================================

/// Stamp a ground effect onto every walkable cell in radius.
pub fn stamp_ground_effect(m: &mut Match, center: Cell, spec: &GroundEffectSpec, prov: Provenance<'_>) {
    let cells: Vec<Cell> = {
        let view = m.terrain_view();
        center.manhattan_area(spec.radius).into_iter().filter(|c| view.is_walkable(*c)).collect()
    };
    for cell in cells {
        m.ground_effects.insert(cell, GroundEffectInstance {
            cell,
            effect_id: spec.effect_id.clone(),
            source_spell_id: prov.spell_id.to_string(),
            source_user_id: prov.caster_id.to_string(),
            duration: spec.duration,
            on_enter: spec.on_enter,
            on_turn_start: spec.on_turn_start,
            blocks_movement: spec.blocks_movement,
            blocks_vision: spec.blocks_vision,
        });
    }
}

/// Change matching tiles in radius.
///
/// Cells holding a unit or entity are never turned into a non-walkable type.
pub fn change_terrain(m: &mut Match, center: Cell, spec: &TerrainChangeSpec, prov: Provenance<'_>) {
    let cells: Vec<(Cell, TileType)> = {
        let view = m.terrain_view();
        center
            .manhattan_area(spec.radius)
            .into_iter()
            .filter(|c| view.tile(*c) == Some(spec.from_type))
            .filter(|c| spec.to_type.is_walkable() || !m.is_occupied(*c))
            .filter_map(|c| m.terrain.base_tile(c).map(|base| (c, base)))
            .collect()
    };
    for (cell, base) in cells {
        if base == spec.to_type {
            m.terrain_modifications.remove(&cell);
            continue;
        }
        m.terrain_modifications.insert(cell, TerrainModification {
            cell,
            original_type: base,
            new_type: spec.to_type,
            duration: spec.duration,
            source_spell_id: prov.spell_id.to_string(),
        });
    }
}

/// Spawn an entity on `cell`. Returns `None` when the cell cannot take it.
pub fn spawn_entity(
    m: &mut Match,
    cell: Cell,
    spec: &EntitySpec,
    prov: Provenance<'_>,
    report: &mut EffectReport,
) -> Option<EntityId> {
    if !m.terrain_view().is_walkable(cell) || m.is_occupied(cell) {
        return None;
    }
    let owner_team = m.team_of(prov.caster_id)?;

    if spec.entity_type == EARTH_BLOCK {
        let mut owned: Vec<(u64, EntityId)> = m
            .entities
            .values()
            .filter(|e| e.entity_type == EARTH_BLOCK && e.owner_user_id == prov.caster_id)
            .map(|e| (e.created_seq, e.id))
            .collect();
        owned.sort_unstable();
        while owned.len() >= MAX_EARTH_BLOCKS_PER_OWNER {
            let (_, oldest) = owned.remove(0);
            m.entities.remove(&oldest);
            report.evicted.push(oldest);
        }
    }

    let (id, created_seq) = m.allocate_entity();
    m.entities.insert(id, SpawnedEntity {
        id,
        entity_type: spec.entity_type.clone(),
        owner_team,
        owner_user_id: prov.caster_id.to_string(),
        source_spell_id: prov.spell_id.to_string(),
        position: cell,
        health: spec.health,
        max_health: spec.health,
        duration: spec.duration,
        trigger: spec.trigger,
        on_trigger: spec.on_trigger,
        on_death: spec.on_death,
        blocks_movement: spec.blocks_movement,
        blocks_vision: spec.blocks_vision,
        created_seq,
    });
    report.spawned.push(id);
    Some(id)
}

/// Damage entities that have health; destroyed ones burst.
pub fn damage_entities(m: &mut Match, ids: &[EntityId], amount: u32, report: &mut EffectReport) {
    for id in ids {
        let Some(entity) = m.entities.get_mut(id) else {
            continue;
        };
        let Some(health) = entity.health.as_mut() else {
            continue;
        };
        *health = health.saturating_sub(amount);
        if *health == 0 {
            kill_entity(m, *id);
            report.killed_entities.push(*id);
        }
    }
}

/// Remove an entity and apply its on-death area deltas.
pub fn kill_entity(m: &mut Match, id: EntityId) {
    let Some(entity) = m.entities.remove(&id) else {
        warn!(entity_id = id, "kill requested for unknown entity");
        return;
    };
    if let Some(burst) = entity.on_death {
        apply_area_deltas(m, entity.position, burst.radius, burst.deltas);
    }
}

/// Apply deltas to every player within a Manhattan radius.
pub fn apply_area_deltas(m: &mut Match, center: Cell, radius: u32, deltas: Deltas) {
    for player in m.players.values_mut() {
        if player.position.manhattan(center) <= radius {
            player.apply_deltas(deltas);
        }
    }
}
