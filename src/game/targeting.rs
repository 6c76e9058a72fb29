//! Spell Targeting
//!
//! Area patterns around a target cell and the team/invisibility filters that
//! decide which units inside the area a spell may touch.

use crate::core::grid::Cell;
use crate::game::spell::{AreaPattern, SpellDefinition, TargetFilter};
use crate::game::state::{EntityId, Match, Player, Team, UserId};

/// Cells covered by `pattern` around `target`, cast from `caster`.
///
/// Cells outside the grid are dropped.
pub fn pattern_cells(m: &Match, pattern: AreaPattern, caster: Cell, target: Cell) -> Vec<Cell> {
    let cells = match pattern {
        AreaPattern::Single => vec![target],
        AreaPattern::Circle1 => target.square_area(1),
        AreaPattern::Circle2 => target.manhattan_area(2),
        AreaPattern::Line3 => line_from(caster, target, 3),
    };
    cells.into_iter().filter(|c| m.terrain.in_bounds(*c)).collect()
}

/// `len` cells starting at `target`, continuing along the dominant axis of
/// the caster→target direction.
fn line_from(caster: Cell, target: Cell, len: i32) -> Vec<Cell> {
    let dx = target.x - caster.x;
    let dy = target.y - caster.y;
    let (sx, sy) = if dx == 0 && dy == 0 {
        return vec![target];
    } else if dx.abs() >= dy.abs() {
        (dx.signum(), 0)
    } else {
        (0, dy.signum())
    };
    (0..len).map(|i| target.offset(sx * i, sy * i)).collect()
}

/// Does `filter` allow a caster on `caster_team` to touch `target_team`?
#[inline]
pub fn team_allowed(filter: TargetFilter, caster_team: Team, target_team: Team) -> bool {
    match filter {
        TargetFilter::Ally => caster_team == target_team,
        TargetFilter::Enemy => caster_team != target_team,
        TargetFilter::Any => true,
    }
}

/// Can someone on `viewer_team` select `target`?
///
/// Invisible enemies are unselectable unless revealed or the spell pierces
/// invisibility. Allies are always selectable.
#[inline]
pub fn is_selectable(viewer_team: Team, target: &Player, ignores_invisibility: bool) -> bool {
    target.team == viewer_team || ignores_invisibility || !target.is_hidden_from_enemies()
}

/// Units inside `cells` the spell may affect, in cell order, without
/// duplicates.
pub fn affected_units(m: &Match, spell: &SpellDefinition, caster_team: Team, cells: &[Cell]) -> Vec<UserId> {
    let mut units: Vec<UserId> = Vec::new();
    for cell in cells {
        let Some(unit) = m.unit_at(*cell) else {
            continue;
        };
        if !team_allowed(spell.affects, caster_team, unit.team) {
            continue;
        }
        if !is_selectable(caster_team, unit, spell.ignores_invisibility) {
            continue;
        }
        if !units.contains(&unit.user_id) {
            units.push(unit.user_id.clone());
        }
    }
    units
}

/// Damageable entities inside `cells` the spell may affect.
pub fn affected_entities(m: &Match, spell: &SpellDefinition, caster_team: Team, cells: &[Cell]) -> Vec<EntityId> {
    m.entities
        .values()
        .filter(|e| e.health.is_some())
        .filter(|e| cells.contains(&e.position))
        .filter(|e| team_allowed(spell.affects, caster_team, e.owner_team))
        .map(|e| e.id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::Invisibility;
    use crate::game::state::tests::open_match;

    #[test]
    fn test_patterns() {
        let m = open_match(&["a"], &["b"]);
        let caster = Cell::new(1, 5);
        let target = Cell::new(5, 5);
        assert_eq!(pattern_cells(&m, AreaPattern::Single, caster, target), vec![target]);
        assert_eq!(pattern_cells(&m, AreaPattern::Circle1, caster, target).len(), 9);
        assert_eq!(pattern_cells(&m, AreaPattern::Circle2, caster, target).len(), 13);
        assert_eq!(
            pattern_cells(&m, AreaPattern::Line3, caster, target),
            vec![Cell::new(5, 5), Cell::new(6, 5), Cell::new(7, 5)]
        );
    }

    #[test]
    fn test_patterns_clipped_to_grid() {
        let m = open_match(&["a"], &["b"]);
        let corner = Cell::new(0, 0);
        assert_eq!(pattern_cells(&m, AreaPattern::Circle1, Cell::new(3, 3), corner).len(), 4);
        let line = pattern_cells(&m, AreaPattern::Line3, Cell::new(0, 3), Cell::new(0, 8));
        assert_eq!(line, vec![Cell::new(0, 8), Cell::new(0, 9)]);
    }

    #[test]
    fn test_team_filters() {
        assert!(team_allowed(TargetFilter::Ally, Team::A, Team::A));
        assert!(!team_allowed(TargetFilter::Ally, Team::A, Team::B));
        assert!(team_allowed(TargetFilter::Enemy, Team::A, Team::B));
        assert!(!team_allowed(TargetFilter::Enemy, Team::B, Team::B));
        assert!(team_allowed(TargetFilter::Any, Team::A, Team::B));
    }

    #[test]
    fn test_invisible_enemy_unselectable() {
        let mut m = open_match(&["a"], &["b"]);
        m.player_mut("b").unwrap().invisibility = Some(Invisibility {
            source_effect_id: "shroud".into(),
            remaining: 2,
        });
        let b = m.player("b").unwrap();
        assert!(!is_selectable(Team::A, b, false));
        assert!(is_selectable(Team::A, b, true));
        assert!(is_selectable(Team::B, b, false));
    }
}
