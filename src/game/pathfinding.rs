//! Grid Pathfinding
//!
//! 4-directional A* with unit step cost and a Manhattan heuristic.
//!
//! Tie-breaking is deterministic (lower f, then lower h, then insertion
//! order, neighbours expanded up/right/down/left) so the same terrain and
//! occupancy always produce the same path, but callers must not rely on
//! which of several equal-cost paths is returned.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

use crate::core::grid::Cell;
use crate::game::terrain::TerrainView;

/// Cells a mover may not enter, on top of terrain walkability.
///
/// Implemented by the match for occupancy and movement-blocking ground
/// effects; closures work too.
pub trait Obstacles {
    /// True when `cell` cannot be entered.
    fn is_blocked(&self, cell: Cell) -> bool;
}

impl<F: Fn(Cell) -> bool> Obstacles for F {
    fn is_blocked(&self, cell: Cell) -> bool {
        self(cell)
    }
}

/// Cost of a path in movement points (steps taken).
#[inline]
pub fn path_cost(path: &[Cell]) -> u32 {
    path.len().saturating_sub(1) as u32
}

/// Find a shortest path from `start` to `goal`.
///
/// Returns an empty vector when unreachable or when the request is rejected
/// up front (start/goal not walkable, goal blocked). A non-empty result
/// always begins with `start` and ends with `goal`. When `max_cost` is set,
/// nodes beyond that many steps are not expanded.
pub fn find_path<O: Obstacles + ?Sized>(
    terrain: &TerrainView<'_>,
    obstacles: &O,
    start: Cell,
    goal: Cell,
    max_cost: Option<u32>,
) -> Vec<Cell> {
    if !terrain.is_walkable(start) || !terrain.is_walkable(goal) {
        return Vec::new();
    }
    if start == goal {
        return vec![start];
    }
    if obstacles.is_blocked(goal) {
        return Vec::new();
    }
    if let Some(limit) = max_cost {
        if start.manhattan(goal) > limit {
            return Vec::new();
        }
    }

    // (f, h, seq) ordering on a min-heap
    let mut open: BinaryHeap<Reverse<(u32, u32, u64, Cell)>> = BinaryHeap::new();
    let mut g_score: BTreeMap<Cell, u32> = BTreeMap::new();
    let mut came_from: BTreeMap<Cell, Cell> = BTreeMap::new();
    let mut seq: u64 = 0;

    g_score.insert(start, 0);
    let h0 = start.manhattan(goal);
    open.push(Reverse((h0, h0, seq, start)));

    while let Some(Reverse((_, _, _, current))) = open.pop() {
        if current == goal {
            return reconstruct(&came_from, start, goal);
        }

        let g = g_score.get(&current).copied().unwrap_or(u32::MAX);

        #[cfg(feature = "debug-tracing")]
        tracing::trace!(?current, g, "a* expand");

        for next in current.neighbors() {
            if !terrain.is_walkable(next) || obstacles.is_blocked(next) {
                continue;
            }
            let tentative = g + 1;
            if max_cost.is_some_and(|limit| tentative > limit) {
                continue;
            }
            if tentative < g_score.get(&next).copied().unwrap_or(u32::MAX) {
                g_score.insert(next, tentative);
                came_from.insert(next, current);
                let h = next.manhattan(goal);
                seq += 1;
                open.push(Reverse((tentative + h, h, seq, next)));
            }
        }
    }

    Vec::new()
}

fn reconstruct(came_from: &BTreeMap<Cell, Cell>, start: Cell, goal: Cell) -> Vec<Cell> {
    let mut path = vec![goal];
    let mut current = goal;
    while current != start {
        match came_from.get(&current) {
            Some(prev) => {
                current = *prev;
                path.push(current);
            }
            None => return Vec::new(),
        }
    }
    path.reverse();
    path
}

/// Check a client-submitted path against the live grid.
///
/// The path must start at `start`, end at `goal`, move one orthogonal step
/// at a time, and every step after the first must be walkable and free.
pub fn validate_path<O: Obstacles + ?Sized>(
    terrain: &TerrainView<'_>,
    obstacles: &O,
    path: &[Cell],
    start: Cell,
    goal: Cell,
) -> bool {
    let (Some(first), Some(last)) = (path.first(), path.last()) else {
        return false;
    };
    if *first != start || *last != goal || path.len() < 2 {
        return false;
    }
    path.windows(2).all(|step| {
        let next = step[1];
        step[0].is_adjacent(next) && terrain.is_walkable(next) && !obstacles.is_blocked(next)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use proptest::prelude::*;
    use crate::game::terrain::{TerrainModel, TileType};

    fn open_grid(w: i32, h: i32) -> TerrainModel {
        TerrainModel::filled(w, h, TileType::Ground)
    }

    fn no_obstacles(_: Cell) -> bool {
        false
    }

    #[test]
    fn test_straight_line_path() {
        let model = open_grid(10, 10);
        let mods = BTreeMap::new();
        let path = find_path(&model.view(&mods), &no_obstacles, Cell::new(2, 2), Cell::new(5, 2), None);
        assert_eq!(path.first(), Some(&Cell::new(2, 2)));
        assert_eq!(path.last(), Some(&Cell::new(5, 2)));
        assert_eq!(path_cost(&path), 3);
    }

    #[test]
    fn test_routes_around_wall() {
        let mut model = open_grid(5, 5);
        for y in 0..4 {
            model.set_base_tile(Cell::new(2, y), TileType::Wall);
        }
        let mods = BTreeMap::new();
        let path = find_path(&model.view(&mods), &no_obstacles, Cell::new(0, 0), Cell::new(4, 0), None);
        // down to row 4, across, back up
        assert_eq!(path_cost(&path), 12);
        assert!(path.iter().all(|c| model.base_tile(*c) == Some(TileType::Ground)));
    }

    #[test]
    fn test_unreachable_returns_empty() {
        let mut model = open_grid(5, 5);
        for y in 0..5 {
            model.set_base_tile(Cell::new(2, y), TileType::Water);
        }
        let mods = BTreeMap::new();
        let path = find_path(&model.view(&mods), &no_obstacles, Cell::new(0, 0), Cell::new(4, 0), None);
        assert!(path.is_empty());
    }

    #[test]
    fn test_goal_blocked_rejected() {
        let model = open_grid(5, 5);
        let mods = BTreeMap::new();
        let goal = Cell::new(3, 3);
        let blocked = |c: Cell| c == goal;
        assert!(find_path(&model.view(&mods), &blocked, Cell::new(0, 0), goal, None).is_empty());
    }

    #[test]
    fn test_occupied_cells_avoided() {
        let model = open_grid(5, 3);
        let mods = BTreeMap::new();
        let blocked = |c: Cell| c == Cell::new(2, 1);
        let path = find_path(&model.view(&mods), &blocked, Cell::new(0, 1), Cell::new(4, 1), None);
        assert_eq!(path_cost(&path), 6);
        assert!(!path.contains(&Cell::new(2, 1)));
    }

    #[test]
    fn test_max_cost_prunes() {
        let model = open_grid(10, 10);
        let mods = BTreeMap::new();
        let view = model.view(&mods);
        assert!(find_path(&view, &no_obstacles, Cell::new(2, 2), Cell::new(6, 2), Some(3)).is_empty());
        assert_eq!(path_cost(&find_path(&view, &no_obstacles, Cell::new(2, 2), Cell::new(5, 2), Some(3))), 3);
    }

    #[test]
    fn test_validate_client_path() {
        let model = open_grid(6, 6);
        let mods = BTreeMap::new();
        let view = model.view(&mods);
        let good = vec![Cell::new(1, 1), Cell::new(2, 1), Cell::new(2, 2)];
        assert!(validate_path(&view, &no_obstacles, &good, Cell::new(1, 1), Cell::new(2, 2)));

        let gap = vec![Cell::new(1, 1), Cell::new(3, 1)];
        assert!(!validate_path(&view, &no_obstacles, &gap, Cell::new(1, 1), Cell::new(3, 1)));

        let wrong_start = vec![Cell::new(0, 1), Cell::new(1, 1)];
        assert!(!validate_path(&view, &no_obstacles, &wrong_start, Cell::new(1, 1), Cell::new(1, 1)));

        let occupied = |c: Cell| c == Cell::new(2, 1);
        assert!(!validate_path(&view, &occupied, &good, Cell::new(1, 1), Cell::new(2, 2)));
    }

    proptest! {
        #[test]
        fn prop_open_grid_cost_is_manhattan(
            sx in 0i32..12, sy in 0i32..12, gx in 0i32..12, gy in 0i32..12,
        ) {
            let model = open_grid(12, 12);
            let mods = BTreeMap::new();
            let start = Cell::new(sx, sy);
            let goal = Cell::new(gx, gy);
            let path = find_path(&model.view(&mods), &no_obstacles, start, goal, None);
            prop_assert_eq!(path[0], start);
            prop_assert_eq!(path_cost(&path), start.manhattan(goal));
            prop_assert!(path.windows(2).all(|w| w[0].is_adjacent(w[1])));
        }
    }
}
