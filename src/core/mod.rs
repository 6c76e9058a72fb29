//! Core deterministic primitives.
//!
//! Grid coordinates and snapshot digests shared by every layer above.

pub mod grid;
pub mod hash;

// Re-export core types
pub use grid::{Cell, normalize_angle, centroid};
pub use hash::{StateHash, SnapshotHasher, snapshot_digest};
