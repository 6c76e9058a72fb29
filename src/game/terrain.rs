//! Terrain Model
//!
//! Static tile grid loaded from the map document, plus the live view that
//! layers terrain modifications on top of it. Everything that asks "can I
//! stand here?" or "can I see through this?" goes through [`TerrainView`].

use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::core::grid::Cell;

// =============================================================================
// TILE TYPES
// =============================================================================

/// Base tile type. Encoded on the wire and in map documents as an integer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum TileType {
    /// Open floor.
    Ground = 0,
    /// Solid wall: impassable, blocks line of sight.
    Wall = 1,
    /// Water: impassable, transparent.
    Water = 2,
}

impl TileType {
    /// Can a unit stand on or path through this tile?
    #[inline]
    pub fn is_walkable(self) -> bool {
        matches!(self, TileType::Ground)
    }

    /// Does this tile stop a line-of-sight ray?
    #[inline]
    pub fn blocks_los(self) -> bool {
        matches!(self, TileType::Wall)
    }

    /// Get from index.
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(TileType::Ground),
            1 => Some(TileType::Wall),
            2 => Some(TileType::Water),
            _ => None,
        }
    }
}

impl TryFrom<u8> for TileType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        TileType::from_index(value).ok_or_else(|| format!("unknown tile type {}", value))
    }
}

impl From<TileType> for u8 {
    fn from(tile: TileType) -> u8 {
        tile as u8
    }
}

// =============================================================================
// MAP DOCUMENT
// =============================================================================

/// Start zones for both teams, as found in the map document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StartZones {
    /// Team A start cells.
    #[serde(rename = "A")]
    pub a: Vec<Cell>,
    /// Team B start cells.
    #[serde(rename = "B")]
    pub b: Vec<Cell>,
}

/// Trusted map document handed over by the map service.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapDocument {
    /// Tile grid, indexed `terrain[y][x]`.
    pub terrain: Vec<Vec<TileType>>,
    /// Start zones keyed by team.
    pub start_zones: StartZones,
}

/// Map validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    /// Terrain grid has no cells.
    #[error("terrain grid is empty")]
    Empty,
    /// Rows have different lengths.
    #[error("terrain row {row} has {len} tiles, expected {expected}")]
    Ragged { row: usize, len: usize, expected: usize },
    /// A start zone has no cells.
    #[error("start zone for team {0} is empty")]
    EmptyStartZone(&'static str),
    /// A start cell is outside the grid or not walkable.
    #[error("start cell {0} for team {1} is not a walkable in-bounds cell")]
    BadStartCell(Cell, &'static str),
    /// JSON parsing failed.
    #[error("invalid map document: {0}")]
    Parse(String),
}

impl MapDocument {
    /// Parse a map document from JSON.
    pub fn from_json(s: &str) -> Result<Self, MapError> {
        serde_json::from_str(s).map_err(|e| MapError::Parse(e.to_string()))
    }
}

// =============================================================================
// TERRAIN MODEL
// =============================================================================

/// Immutable base grid.
#[derive(Clone, Debug)]
pub struct TerrainModel {
    width: i32,
    height: i32,
    tiles: Vec<TileType>,
}

impl TerrainModel {
    /// Build from a map document, validating shape and start zones.
    pub fn from_document(doc: &MapDocument) -> Result<Self, MapError> {
        let height = doc.terrain.len();
        let width = doc.terrain.first().map(|r| r.len()).unwrap_or(0);
        if height == 0 || width == 0 {
            return Err(MapError::Empty);
        }

        let mut tiles = Vec::with_capacity(width * height);
        for (row, line) in doc.terrain.iter().enumerate() {
            if line.len() != width {
                return Err(MapError::Ragged { row, len: line.len(), expected: width });
            }
            tiles.extend_from_slice(line);
        }

        let model = Self { width: width as i32, height: height as i32, tiles };

        for (zone, name) in [(&doc.start_zones.a, "A"), (&doc.start_zones.b, "B")] {
            if zone.is_empty() {
                return Err(MapError::EmptyStartZone(name));
            }
            if let Some(bad) = zone.iter().find(|c| !model.base_tile(**c).is_some_and(TileType::is_walkable)) {
                return Err(MapError::BadStartCell(*bad, name));
            }
        }

        Ok(model)
    }

    /// Uniform grid of one tile type.
    pub fn filled(width: i32, height: i32, tile: TileType) -> Self {
        Self {
            width,
            height,
            tiles: vec![tile; (width.max(0) * height.max(0)) as usize],
        }
    }

    /// Grid width.
    pub fn width(&self) -> i32 {
        self.width
    }

    /// Grid height.
    pub fn height(&self) -> i32 {
        self.height
    }

    /// Is the cell inside the grid?
    #[inline]
    pub fn in_bounds(&self, cell: Cell) -> bool {
        cell.x >= 0 && cell.y >= 0 && cell.x < self.width && cell.y < self.height
    }

    /// Base tile, ignoring modifications.
    #[inline]
    pub fn base_tile(&self, cell: Cell) -> Option<TileType> {
        if !self.in_bounds(cell) {
            return None;
        }
        self.tiles.get((cell.y * self.width + cell.x) as usize).copied()
    }

    /// Overwrite a base tile (map editing in tests and tools).
    pub fn set_base_tile(&mut self, cell: Cell, tile: TileType) {
        if self.in_bounds(cell) {
            let idx = (cell.y * self.width + cell.x) as usize;
            self.tiles[idx] = tile;
        }
    }

    /// Layer live modifications over this grid.
    pub fn view<'a>(&'a self, modifications: &'a BTreeMap<Cell, TerrainModification>) -> TerrainView<'a> {
        TerrainView { model: self, modifications }
    }
}

// =============================================================================
// TERRAIN MODIFICATIONS
// =============================================================================

/// Temporary (or permanent) override of a cell's tile type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerrainModification {
    /// Affected cell.
    pub cell: Cell,
    /// Tile type before the change.
    pub original_type: TileType,
    /// Tile type while the change is active.
    pub new_type: TileType,
    /// Remaining turns; 0 = permanent.
    pub duration: u32,
    /// Spell that caused the change.
    pub source_spell_id: String,
}

impl TerrainModification {
    /// Permanent modifications never tick down.
    #[inline]
    pub fn is_permanent(&self) -> bool {
        self.duration == 0
    }
}

/// Base grid with live modifications applied.
#[derive(Clone, Copy)]
pub struct TerrainView<'a> {
    model: &'a TerrainModel,
    modifications: &'a BTreeMap<Cell, TerrainModification>,
}

impl<'a> TerrainView<'a> {
    /// Underlying base grid.
    pub fn model(&self) -> &'a TerrainModel {
        self.model
    }

    /// Is the cell inside the grid?
    #[inline]
    pub fn in_bounds(&self, cell: Cell) -> bool {
        self.model.in_bounds(cell)
    }

    /// Effective tile type under current modifications.
    pub fn tile(&self, cell: Cell) -> Option<TileType> {
        let base = self.model.base_tile(cell)?;
        Some(self.modifications.get(&cell).map(|m| m.new_type).unwrap_or(base))
    }

    /// In bounds and walkable right now.
    #[inline]
    pub fn is_walkable(&self, cell: Cell) -> bool {
        self.tile(cell).is_some_and(TileType::is_walkable)
    }

    /// In bounds and blocking line of sight right now.
    #[inline]
    pub fn blocks_los(&self, cell: Cell) -> bool {
        self.tile(cell).is_some_and(TileType::blocks_los)
    }
}
