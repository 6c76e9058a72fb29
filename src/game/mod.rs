//! Game Logic Module
//!
//! All match rules. Deterministic apart from the start/end timestamps
//! recorded for the stats screen.
//!
//! ## Module Structure
//!
//! - `terrain`: Tile grid and live terrain modifications
//! - `pathfinding`: Grid A*
//! - `los`: Bresenham line of sight
//! - `spell`: Read-only spell catalog
//! - `state`: Match aggregate and records
//! - `targeting`: Area patterns and target filters
//! - `effects`: Effect engine
//! - `tick`: Turn start/end and global countdowns
//! - `engine`: Phase machine and inbound handlers
//! - `events`: Broadcasts and deferred actions
//! - `view`: Per-viewer filtered snapshot
//! - `stats`: Results blob

pub mod terrain;
pub mod pathfinding;
pub mod los;
pub mod spell;
pub mod state;
pub mod targeting;
pub mod effects;
pub mod tick;
pub mod engine;
pub mod events;
pub mod view;
pub mod stats;

// Re-export key types
pub use terrain::{MapDocument, MapError, StartZones, TerrainModel, TileType};
pub use spell::{CatalogError, SpellCatalog, SpellDefinition, SpellEffect};
pub use state::{Match, MatchPhase, Player, PlayerSeed, SetupError, Team, UserId};
pub use engine::{MatchEngine, MatchTimings, Outcome, Rejection};
pub use events::{DeferredAction, GameEvent, Scheduled, ValidityToken};
pub use view::MatchView;
pub use stats::MatchStats;
