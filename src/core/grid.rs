//! Grid Coordinates
//!
//! Integer cell coordinates and the distance/orientation helpers shared by
//! terrain, pathfinding, line of sight and targeting.

use std::f64::consts::PI;
use std::fmt;
use serde::{Serialize, Deserialize};

/// A cell on the tactical grid.
///
/// `x` grows to the right (column), `y` grows downward (row).
/// Ordering is row-major so `BTreeMap<Cell, _>` iterates deterministically.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Cell {
    /// Column.
    pub x: i32,
    /// Row.
    pub y: i32,
}

impl Cell {
    /// Create a new cell.
    #[inline]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Manhattan (taxicab) distance.
    #[inline]
    pub fn manhattan(self, other: Self) -> u32 {
        self.x.abs_diff(other.x) + self.y.abs_diff(other.y)
    }

    /// Chebyshev (king-move) distance.
    #[inline]
    pub fn chebyshev(self, other: Self) -> u32 {
        self.x.abs_diff(other.x).max(self.y.abs_diff(other.y))
    }

    /// Offset by a delta.
    #[inline]
    pub const fn offset(self, dx: i32, dy: i32) -> Self {
        Self { x: self.x + dx, y: self.y + dy }
    }

    /// The four orthogonal neighbours, in up/right/down/left order.
    #[inline]
    pub fn neighbors(self) -> [Cell; 4] {
        [
            self.offset(0, -1),
            self.offset(1, 0),
            self.offset(0, 1),
            self.offset(-1, 0),
        ]
    }

    /// True when `other` is exactly one orthogonal step away.
    #[inline]
    pub fn is_adjacent(self, other: Self) -> bool {
        self.manhattan(other) == 1
    }

    /// Every cell within a Manhattan radius, row-major.
    pub fn manhattan_area(self, radius: u32) -> Vec<Cell> {
        let r = radius as i32;
        let mut cells = Vec::new();
        for dy in -r..=r {
            let span = r - dy.abs();
            for dx in -span..=span {
                cells.push(self.offset(dx, dy));
            }
        }
        cells
    }

    /// Every cell within a Chebyshev radius (a square), row-major.
    pub fn square_area(self, radius: u32) -> Vec<Cell> {
        let r = radius as i32;
        let mut cells = Vec::with_capacity(((2 * r + 1) * (2 * r + 1)) as usize);
        for dy in -r..=r {
            for dx in -r..=r {
                cells.push(self.offset(dx, dy));
            }
        }
        cells
    }

    /// Composite key used by wire payloads and logs (`"x,y"`).
    pub fn key(self) -> String {
        format!("{},{}", self.x, self.y)
    }

    /// Angle in radians from this cell toward another, normalized.
    pub fn angle_to(self, other: Self) -> f64 {
        let dx = (other.x - self.x) as f64;
        let dy = (other.y - self.y) as f64;
        normalize_angle(dy.atan2(dx))
    }
}

impl Ord for Cell {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.y.cmp(&other.y).then(self.x.cmp(&other.x))
    }
}

impl PartialOrd for Cell {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

impl From<(i32, i32)> for Cell {
    fn from((x, y): (i32, i32)) -> Self {
        Self::new(x, y)
    }
}

/// Normalize an angle into the half-open interval (-π, π].
///
/// Non-finite input collapses to 0.
pub fn normalize_angle(angle: f64) -> f64 {
    if !angle.is_finite() {
        return 0.0;
    }
    let mut a = angle % (2.0 * PI);
    if a <= -PI {
        a += 2.0 * PI;
    } else if a > PI {
        a -= 2.0 * PI;
    }
    a
}

/// Integer centroid of a set of cells (rounded toward zero).
pub fn centroid(cells: &[Cell]) -> Option<Cell> {
    if cells.is_empty() {
        return None;
    }
    let n = cells.len() as i64;
    let sx: i64 = cells.iter().map(|c| c.x as i64).sum();
    let sy: i64 = cells.iter().map(|c| c.y as i64).sum();
    Some(Cell::new((sx / n) as i32, (sy / n) as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distances() {
        let a = Cell::new(2, 2);
        let b = Cell::new(5, 4);
        assert_eq!(a.manhattan(b), 5);
        assert_eq!(a.chebyshev(b), 3);
        assert!(a.is_adjacent(Cell::new(2, 3)));
        assert!(!a.is_adjacent(Cell::new(3, 3)));
    }

    #[test]
    fn test_manhattan_area_size() {
        // 1 + 4 + 8 cells for radius 2
        assert_eq!(Cell::new(0, 0).manhattan_area(2).len(), 13);
        assert_eq!(Cell::new(0, 0).manhattan_area(0), vec![Cell::new(0, 0)]);
        assert_eq!(Cell::new(4, 4).square_area(1).len(), 9);
    }

    #[test]
    fn test_row_major_ordering() {
        let mut cells = vec![Cell::new(3, 1), Cell::new(0, 2), Cell::new(1, 1)];
        cells.sort();
        assert_eq!(cells, vec![Cell::new(1, 1), Cell::new(3, 1), Cell::new(0, 2)]);
    }

    #[test]
    fn test_normalize_angle_range() {
        assert!((normalize_angle(3.0 * PI) - PI).abs() < 1e-9);
        assert!((normalize_angle(-PI) - PI).abs() < 1e-9);
        assert!((normalize_angle(0.5) - 0.5).abs() < 1e-9);
        assert_eq!(normalize_angle(f64::NAN), 0.0);
        let a = normalize_angle(-7.5);
        assert!(a > -PI && a <= PI);
    }

    #[test]
    fn test_angle_to() {
        let origin = Cell::new(0, 0);
        assert!((origin.angle_to(Cell::new(1, 0))).abs() < 1e-9);
        assert!((origin.angle_to(Cell::new(0, 1)) - PI / 2.0).abs() < 1e-9);
        assert!((origin.angle_to(Cell::new(-1, 0)) - PI).abs() < 1e-9);
    }

    #[test]
    fn test_centroid() {
        let zone = [Cell::new(0, 0), Cell::new(2, 0), Cell::new(1, 3)];
        assert_eq!(centroid(&zone), Some(Cell::new(1, 1)));
        assert_eq!(centroid(&[]), None);
    }
}
