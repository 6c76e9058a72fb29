//! Spell Catalog
//!
//! Read-only spell definitions: targeting rules, cost, effect list and
//! presentation metadata. The catalog is data handed to the server by an
//! external service; the engine only ever reads it.

use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::game::terrain::TileType;

/// Spell identifier as used in loadouts and on the wire.
pub type SpellId = String;

// =============================================================================
// TARGETING
// =============================================================================

/// What a spell is aimed at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetKind {
    /// Any walkable ground cell.
    Cell,
    /// A cell holding a selectable unit.
    Unit,
}

/// Area resolved around each target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AreaPattern {
    /// Exactly the target cell.
    #[default]
    Single,
    /// 3×3 square around the target.
    Circle1,
    /// Manhattan radius 2 around the target.
    Circle2,
    /// Three cells from the target onward, away from the caster.
    Line3,
}

/// Which units an effect may touch, relative to the caster's team.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetFilter {
    /// Caster's team only.
    Ally,
    /// Opposing team only.
    Enemy,
    /// Everyone.
    #[default]
    Any,
}

/// Inclusive Manhattan range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpellRange {
    /// Minimum distance.
    pub min: u32,
    /// Maximum distance.
    pub max: u32,
}

impl SpellRange {
    /// Is `distance` inside the range?
    #[inline]
    pub fn contains(&self, distance: u32) -> bool {
        distance >= self.min && distance <= self.max
    }
}

// =============================================================================
// EFFECT PAYLOADS
// =============================================================================

/// Flat resource changes applied by statuses, ground effects and entities.
///
/// Negative health is damage, positive is healing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Deltas {
    /// Health change.
    pub health: i32,
    /// Energy change.
    pub energy: i32,
    /// Movement point change.
    pub movement: i32,
}

impl Deltas {
    /// No change at all.
    pub fn is_empty(&self) -> bool {
        self.health == 0 && self.energy == 0 && self.movement == 0
    }

    /// Multiply every component (status stacks).
    pub fn scaled(&self, factor: u32) -> Self {
        let f = factor as i32;
        Self {
            health: self.health.saturating_mul(f),
            energy: self.energy.saturating_mul(f),
            movement: self.movement.saturating_mul(f),
        }
    }
}

/// Damage school, carried through to statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DamageElement {
    /// Weapon damage.
    #[default]
    Physical,
    /// Spell damage.
    Magic,
}

/// Status effect payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEffectSpec {
    /// Stable id; refreshing/stacking is keyed on it.
    pub effect_id: String,
    /// Turns the status lasts.
    pub duration: u32,
    /// Whether reapplying adds a stack.
    #[serde(default)]
    pub stackable: bool,
    /// Stack cap for stackable effects.
    #[serde(default = "default_max_stacks")]
    pub max_stacks: u32,
    /// Fired once when a new instance is created.
    #[serde(default)]
    pub on_apply: Deltas,
    /// Fired at the bearer's turn start, scaled by stacks.
    #[serde(default)]
    pub on_turn_start: Deltas,
    /// Fired at the bearer's turn end, scaled by stacks.
    #[serde(default)]
    pub on_turn_end: Deltas,
    /// Fired when the status expires.
    #[serde(default)]
    pub on_remove: Deltas,
    /// Makes the bearer invisible while active.
    #[serde(default)]
    pub grants_invisibility: bool,
    /// Makes an invisible bearer selectable and visible to enemies.
    #[serde(default)]
    pub reveals_invisibility: bool,
}

fn default_max_stacks() -> u32 {
    1
}

/// Ground effect payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundEffectSpec {
    /// Stable id.
    pub effect_id: String,
    /// Manhattan radius around the target.
    #[serde(default)]
    pub radius: u32,
    /// Turns the effect lasts; 0 = permanent.
    pub duration: u32,
    /// Applied to a unit that ends a move on the cell.
    #[serde(default)]
    pub on_enter: Deltas,
    /// Applied to a unit starting its turn on the cell.
    #[serde(default)]
    pub on_turn_start: Deltas,
    /// Cell cannot be entered.
    #[serde(default)]
    pub blocks_movement: bool,
    /// Cell blocks line of sight.
    #[serde(default)]
    pub blocks_vision: bool,
}

/// Terrain change payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerrainChangeSpec {
    /// Only cells currently of this type change.
    pub from_type: TileType,
    /// Type while the change lasts.
    pub to_type: TileType,
    /// Manhattan radius around the target.
    #[serde(default)]
    pub radius: u32,
    /// Turns the change lasts; 0 = permanent.
    #[serde(default)]
    pub duration: u32,
}

/// What wakes a spawned entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerSpec {
    /// An opposing player moves onto the entity's cell.
    Movement,
    /// An opposing player is within a Manhattan radius.
    Proximity {
        /// Trigger radius.
        radius: u32,
    },
}

/// Deltas applied to every player within a radius.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaDeltas {
    /// Manhattan radius around the entity.
    pub radius: u32,
    /// Deltas applied to each player inside.
    pub deltas: Deltas,
}

/// Entity spawn payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySpec {
    /// Entity type (e.g. `earth_block`).
    pub entity_type: String,
    /// Hit points; `None` means the entity cannot be damaged.
    #[serde(default)]
    pub health: Option<u32>,
    /// Turns the entity lasts; 0 = permanent.
    #[serde(default)]
    pub duration: u32,
    /// Trigger condition, if any.
    #[serde(default)]
    pub trigger: Option<TriggerSpec>,
    /// Applied to the triggering player(s).
    #[serde(default)]
    pub on_trigger: Deltas,
    /// Area burst when the entity dies or expires.
    #[serde(default)]
    pub on_death: Option<AreaDeltas>,
    /// Occupies its cell for movement.
    #[serde(default)]
    pub blocks_movement: bool,
    /// Occupies its cell for line of sight.
    #[serde(default)]
    pub blocks_vision: bool,
}

/// One declared effect of a spell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpellEffect {
    /// Health loss, clamped at 0.
    Damage {
        /// Amount removed.
        amount: u32,
        /// Damage school.
        #[serde(default)]
        element: DamageElement,
    },
    /// Health gain, clamped at max.
    Heal {
        /// Amount restored.
        amount: u32,
    },
    /// Movement point grant (may exceed max until turn end).
    Movement {
        /// Points granted.
        amount: i32,
    },
    /// Moves the caster onto the target cell after the impact delay.
    Teleport,
    /// Create/refresh/stack a status.
    StatusEffect(StatusEffectSpec),
    /// Stamp a ground effect.
    GroundEffect(GroundEffectSpec),
    /// Change tiles.
    TerrainChange(TerrainChangeSpec),
    /// Spawn an entity.
    SpawnEntity(EntitySpec),
}

// =============================================================================
// PRESENTATION
// =============================================================================

/// Client-side presentation metadata. Opaque to the engine except for the
/// impact delay, which schedules hit notifications and teleports.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Presentation {
    /// Animation definition for the prep pose.
    pub prep_anim: Value,
    /// Animation definition for the cast.
    pub cast_anim: Value,
    /// Milliseconds between cast broadcast and impact.
    pub impact_delay_ms: u64,
    /// Anything else the client wants echoed back.
    pub extra: Value,
}

// =============================================================================
// SPELL DEFINITION
// =============================================================================

/// A single catalog entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpellDefinition {
    /// Spell id (filled from the catalog key when absent).
    #[serde(default)]
    pub id: SpellId,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Energy cost.
    pub cost: u32,
    /// Allowed Manhattan distance.
    pub range: SpellRange,
    /// Cell or unit targeting.
    pub target_kind: TargetKind,
    /// Whether a clear ray to each target is needed.
    #[serde(default = "default_true")]
    pub requires_los: bool,
    /// Area around each target.
    #[serde(default)]
    pub pattern: AreaPattern,
    /// Unit filter for unit-acting effects.
    #[serde(default)]
    pub affects: TargetFilter,
    /// Invisible enemies can be hit.
    #[serde(default)]
    pub ignores_invisibility: bool,
    /// Upper bound on `targets[]` length.
    #[serde(default = "default_max_targets")]
    pub max_targets: usize,
    /// Effects in application order.
    pub effects: Vec<SpellEffect>,
    /// Client presentation.
    #[serde(default)]
    pub presentation: Presentation,
}

fn default_true() -> bool {
    true
}

fn default_max_targets() -> usize {
    1
}

impl SpellDefinition {
    /// Does any effect reposition the caster?
    pub fn repositions_caster(&self) -> bool {
        self.effects.iter().any(|e| matches!(e, SpellEffect::Teleport))
    }

    /// Impact delay in milliseconds.
    pub fn impact_delay_ms(&self) -> u64 {
        self.presentation.impact_delay_ms
    }

    /// Reject definitions the engine cannot use.
    fn validate(&self) -> Result<(), String> {
        if self.range.min > self.range.max {
            return Err(format!("range min {} > max {}", self.range.min, self.range.max));
        }
        if self.max_targets == 0 {
            return Err("maxTargets must be at least 1".into());
        }
        for effect in &self.effects {
            if let SpellEffect::StatusEffect(spec) = effect {
                if spec.max_stacks == 0 {
                    return Err(format!("status {} has maxStacks 0", spec.effect_id));
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// CATALOG
// =============================================================================

/// Catalog loading errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Document is not a JSON object keyed by spell id.
    #[error("spell catalog must be a JSON object keyed by spell id")]
    NotAnObject,
    /// JSON parsing failed.
    #[error("invalid spell catalog: {0}")]
    Parse(#[from] serde_json::Error),
    /// Reading the file failed.
    #[error("failed to read spell catalog: {0}")]
    Io(#[from] std::io::Error),
}

/// Read-only spell catalog.
#[derive(Clone, Debug, Default)]
pub struct SpellCatalog {
    spells: BTreeMap<SpellId, SpellDefinition>,
}

impl SpellCatalog {
    /// Build from already-parsed definitions.
    pub fn from_definitions(defs: impl IntoIterator<Item = SpellDefinition>) -> Self {
        let spells = defs.into_iter().map(|d| (d.id.clone(), d)).collect();
        Self { spells }
    }

    /// Parse a catalog document.
    ///
    /// Entries that fail to parse or validate are skipped with a warning so
    /// one bad record does not take the whole catalog down.
    pub fn from_json(s: &str) -> Result<Self, CatalogError> {
        let root: Value = serde_json::from_str(s)?;
        let Value::Object(entries) = root else {
            return Err(CatalogError::NotAnObject);
        };

        let mut spells = BTreeMap::new();
        for (id, raw) in entries {
            let mut def: SpellDefinition = match serde_json::from_value(raw) {
                Ok(def) => def,
                Err(e) => {
                    warn!(spell_id = %id, error = %e, "skipping malformed spell");
                    continue;
                }
            };
            if def.id.is_empty() {
                def.id = id.clone();
            }
            if let Err(reason) = def.validate() {
                warn!(spell_id = %id, %reason, "skipping invalid spell");
                continue;
            }
            spells.insert(id, def);
        }

        Ok(Self { spells })
    }

    /// Load from a file path.
    pub fn load(path: &std::path::Path) -> Result<Self, CatalogError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Look up a spell.
    pub fn get(&self, id: &str) -> Option<&SpellDefinition> {
        self.spells.get(id)
    }

    /// Number of spells.
    pub fn len(&self) -> usize {
        self.spells.len()
    }

    /// Is the catalog empty?
    pub fn is_empty(&self) -> bool {
        self.spells.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "arcane_bolt": {
            "name": "Arcane Bolt",
            "cost": 3,
            "range": {"min": 2, "max": 6},
            "targetKind": "CELL",
            "effects": [{"kind": "DAMAGE", "amount": 5, "element": "MAGIC"}],
            "presentation": {"castAnim": {"clip": "bolt"}, "impactDelayMs": 600}
        },
        "venom": {
            "cost": 2,
            "range": {"min": 1, "max": 4},
            "targetKind": "UNIT",
            "affects": "ENEMY",
            "effects": [{
                "kind": "STATUS_EFFECT",
                "effectId": "poison",
                "duration": 3,
                "stackable": true,
                "maxStacks": 3,
                "onTurnStart": {"health": -2}
            }]
        },
        "broken": {"cost": "lots"},
        "backwards": {
            "cost": 1,
            "range": {"min": 5, "max": 2},
            "targetKind": "CELL",
            "effects": []
        }
    }"#;

    #[test]
    fn test_parse_catalog() {
        let catalog = SpellCatalog::from_json(CATALOG).unwrap();
        assert_eq!(catalog.len(), 2);

        let bolt = catalog.get("arcane_bolt").unwrap();
        assert_eq!(bolt.id, "arcane_bolt");
        assert!(bolt.requires_los);
        assert_eq!(bolt.pattern, AreaPattern::Single);
        assert_eq!(bolt.impact_delay_ms(), 600);
        assert_eq!(
            bolt.effects[0],
            SpellEffect::Damage { amount: 5, element: DamageElement::Magic }
        );

        let venom = catalog.get("venom").unwrap();
        match &venom.effects[0] {
            SpellEffect::StatusEffect(spec) => {
                assert_eq!(spec.max_stacks, 3);
                assert_eq!(spec.on_turn_start.health, -2);
                assert!(spec.on_remove.is_empty());
            }
            other => panic!("unexpected effect {:?}", other),
        }
    }

    #[test]
    fn test_malformed_entries_skipped() {
        let catalog = SpellCatalog::from_json(CATALOG).unwrap();
        assert!(catalog.get("broken").is_none());
        assert!(catalog.get("backwards").is_none());
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(matches!(SpellCatalog::from_json("[1,2]"), Err(CatalogError::NotAnObject)));
    }

    #[test]
    fn test_deltas_scaling() {
        let d = Deltas { health: -2, energy: 1, movement: 0 };
        assert_eq!(d.scaled(3), Deltas { health: -6, energy: 3, movement: 0 });
    }

    #[test]
    fn test_range_contains() {
        let range = SpellRange { min: 2, max: 6 };
        assert!(!range.contains(1));
        assert!(range.contains(2));
        assert!(range.contains(6));
        assert!(!range.contains(7));
    }

    #[test]
    fn test_bundled_catalog_loads_fully() {
        let text = include_str!("../../data/spells.json");
        let raw: serde_json::Map<String, Value> = serde_json::from_str(text).unwrap();
        let catalog = SpellCatalog::from_json(text).unwrap();
        assert_eq!(catalog.len(), raw.len());
        assert!(catalog.get("blink").unwrap().repositions_caster());
    }
}
