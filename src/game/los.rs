//! Line of Sight
//!
//! Integer Bresenham rays between cell centres. Only the cells strictly
//! between the endpoints are tested, so neither the caster's own cell nor
//! the target cell can block. The result depends only on the terrain view
//! and the occupancy predicate, which lets a client preview reproduce the
//! server's answer exactly.

use crate::core::grid::Cell;
use crate::game::pathfinding::Obstacles;
use crate::game::terrain::TerrainView;

/// Cells on the Bresenham line from `from` to `to`, both endpoints included.
pub fn ray_cells(from: Cell, to: Cell) -> Vec<Cell> {
    let dx = (to.x - from.x).abs();
    let dy = -(to.y - from.y).abs();
    let sx = if from.x < to.x { 1 } else { -1 };
    let sy = if from.y < to.y { 1 } else { -1 };

    let mut err = dx + dy;
    let mut x = from.x;
    let mut y = from.y;
    let mut cells = Vec::with_capacity((dx - dy + 1) as usize);

    loop {
        cells.push(Cell::new(x, y));
        if x == to.x && y == to.y {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }

    cells
}

/// True when nothing between `from` and `to` blocks vision.
///
/// `occupants` reports vision-blocking units, entities and ground effects.
pub fn has_line_of_sight<O: Obstacles + ?Sized>(
    terrain: &TerrainView<'_>,
    occupants: &O,
    from: Cell,
    to: Cell,
) -> bool {
    let cells = ray_cells(from, to);
    if cells.len() <= 2 {
        return true;
    }
    cells[1..cells.len() - 1]
        .iter()
        .all(|c| !terrain.blocks_los(*c) && !occupants.is_blocked(*c))
}
