//! Snapshot Hashing
//!
//! Domain-separated SHA-256 digests of serialized views. Two viewers that
//! receive the same filtered snapshot must see the same digest, so the
//! digest is computed over the exact JSON bytes that go on the wire.

use serde::Serialize;
use sha2::{Sha256, Digest};

/// Hash output type (256 bits / 32 bytes)
pub type StateHash = [u8; 32];

/// Domain separator for filtered match snapshots.
pub const SNAPSHOT_DOMAIN: &[u8] = b"SKIRMISH_SNAPSHOT_V1";

/// Incremental hasher with a domain prefix.
pub struct SnapshotHasher {
    hasher: Sha256,
}

impl SnapshotHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Hasher for filtered match snapshots.
    pub fn for_snapshot() -> Self {
        Self::new(SNAPSHOT_DOMAIN)
    }

    /// Update with raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Update with the JSON encoding of a value.
    pub fn update_json<T: Serialize>(&mut self, value: &T) -> Result<(), serde_json::Error> {
        let bytes = serde_json::to_vec(value)?;
        self.hasher.update(&bytes);
        Ok(())
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> StateHash {
        self.hasher.finalize().into()
    }
}

/// Digest of a snapshot's JSON encoding, hex-encoded for the wire.
pub fn snapshot_digest<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let mut hasher = SnapshotHasher::for_snapshot();
    hasher.update_json(value)?;
    Ok(hex::encode(hasher.finalize()))
}
