//! # Skirmish Match Server
//!
//! Authoritative server for two-team, turn-based tactical matches.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    SKIRMISH SERVER                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  ├── grid.rs     - Cells, distances, facing                  │
//! │  └── hash.rs     - Snapshot digests                          │
//! │                                                              │
//! │  game/           - Match rules (deterministic)               │
//! │  ├── terrain.rs  - Tile grid and live modifications          │
//! │  ├── pathfinding.rs - Grid A*                                │
//! │  ├── los.rs      - Line of sight                             │
//! │  ├── spell.rs    - Spell catalog                             │
//! │  ├── state.rs    - Match aggregate                           │
//! │  ├── targeting.rs- Area patterns and filters                 │
//! │  ├── effects.rs  - Effect engine                             │
//! │  ├── tick.rs     - Turn start/end and global ticking         │
//! │  ├── engine.rs   - Phase machine and handlers                │
//! │  ├── events.rs   - Broadcasts and deferred actions           │
//! │  ├── view.rs     - Per-viewer filtered snapshot              │
//! │  └── stats.rs    - Results blob                              │
//! │                                                              │
//! │  network/        - Networking (non-deterministic)            │
//! │  ├── server.rs   - WebSocket server                          │
//! │  ├── protocol.rs - Message types                             │
//! │  ├── auth.rs     - Join tokens                               │
//! │  ├── roster.rs   - Room hand-off and character lookup        │
//! │  └── session.rs  - One task per match                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism
//!
//! Given the same match state and the same inbound message, `game/` always
//! produces the same result:
//! - No HashMap (uses BTreeMap for sorted iteration)
//! - No randomness
//! - Wall-clock time is only read for the stats timestamps
//!
//! Handlers for one match run strictly one at a time inside that match's
//! session task.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use config::{ConfigError, ServerConfig};
pub use core::grid::Cell;
pub use game::{Match, MatchEngine, MatchPhase, MatchView, SpellCatalog, Team};
pub use network::{GameServer, RoomDocument};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
