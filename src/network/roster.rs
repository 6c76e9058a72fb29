//! Room Hand-off
//!
//! A room arrives as a trusted document: map, roster and ids. This module
//! turns it into a `Match` and fills in character profiles from the
//! character service.

use std::collections::BTreeMap;
use std::path::Path;

use futures_util::future::{self, BoxFuture, FutureExt};
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::game::spell::SpellId;
use crate::game::state::{BaseStats, CharacterProfile, Match, PlayerSeed, SetupError, Team, UserId};
use crate::game::terrain::{MapDocument, MapError, TerrainModel};

// =============================================================================
// DOCUMENTS
// =============================================================================

/// One roster line from the matchmaking service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterMember {
    /// Account id.
    pub user_id: UserId,
    /// Display name.
    pub username: String,
    /// Character id, used for the profile lookup.
    pub character_id: String,
    /// Character class.
    pub character_class: String,
    /// Side.
    pub team: Team,
    /// Encoded spell id list, see [`decode_loadout`].
    #[serde(default)]
    pub spell_loadout: String,
}

impl RosterMember {
    /// Decode the loadout and build the seed `Match::new` expects.
    pub fn to_seed(&self, base: BaseStats) -> Result<PlayerSeed, RosterError> {
        let spell_loadout = decode_loadout(&self.spell_loadout).map_err(|reason| RosterError::Loadout {
            user_id: self.user_id.clone(),
            reason,
        })?;
        Ok(PlayerSeed {
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            character_id: self.character_id.clone(),
            character_class: self.character_class.clone(),
            team: self.team,
            spell_loadout,
            base,
        })
    }
}

/// Everything needed to open a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDocument {
    /// Room id; a fresh UUID when absent.
    #[serde(default)]
    pub match_id: Option<String>,
    /// Map id, informational.
    pub map_id: String,
    /// Terrain and start zones.
    pub map: MapDocument,
    /// Players, in turn-order preference.
    pub roster: Vec<RosterMember>,
    /// Resource caps for every player.
    #[serde(default)]
    pub base_stats: BaseStats,
}

impl RoomDocument {
    /// Parse a room document.
    pub fn from_json(s: &str) -> Result<Self, RosterError> {
        serde_json::from_str(s).map_err(|e| RosterError::Parse(e.to_string()))
    }

    /// Read and parse a room file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RosterError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| RosterError::Io(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_json(&text)
    }

    /// Room id, generating one if the document has none.
    pub fn resolved_match_id(&self) -> String {
        self.match_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    /// Build the match in PREPARATION.
    pub fn build_match(&self) -> Result<Match, RosterError> {
        let terrain = TerrainModel::from_document(&self.map)?;
        let seeds = self
            .roster
            .iter()
            .map(|member| member.to_seed(self.base_stats))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Match::new(self.resolved_match_id(), self.map_id.clone(), terrain, &self.map.start_zones, seeds)?)
    }
}

/// Decode a roster loadout: comma separated (`"fireball,heal"`) or a JSON
/// array string (`"[\"fireball\",\"heal\"]"`). Blank entries and repeats
/// are dropped.
pub fn decode_loadout(encoded: &str) -> Result<Vec<SpellId>, String> {
    let trimmed = encoded.trim();
    let raw: Vec<String> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).map_err(|e| e.to_string())?
    } else {
        trimmed.split(',').map(str::to_string).collect()
    };

    let mut loadout: Vec<SpellId> = Vec::with_capacity(raw.len());
    for id in raw {
        let id = id.trim();
        if !id.is_empty() && !loadout.iter().any(|known| known == id) {
            loadout.push(id.to_string());
        }
    }
    Ok(loadout)
}

// =============================================================================
// ERRORS
// =============================================================================

/// Room hand-off errors.
#[derive(Debug, Error)]
pub enum RosterError {
    /// Document did not parse.
    #[error("invalid room document: {0}")]
    Parse(String),
    /// Room file unreadable.
    #[error("cannot read room file: {0}")]
    Io(String),
    /// Map rejected.
    #[error("invalid map: {0}")]
    Map(#[from] MapError),
    /// Roster rejected.
    #[error("invalid roster: {0}")]
    Setup(#[from] SetupError),
    /// Loadout did not decode.
    #[error("invalid spell loadout for {user_id}: {reason}")]
    Loadout {
        /// Offending roster entry.
        user_id: UserId,
        /// Decoder message.
        reason: String,
    },
    /// Character service failure.
    #[error("character lookup failed: {0}")]
    Lookup(String),
}

// =============================================================================
// CHARACTER LOOKUP
// =============================================================================

/// Character service.
pub trait CharacterDirectory: Send + Sync {
    /// Fetch a character profile. `Ok(None)` means the character is unknown.
    fn fetch(&self, character_id: &str) -> BoxFuture<'_, Result<Option<CharacterProfile>, RosterError>>;
}

/// In-memory directory, also used when no character service is configured.
#[derive(Debug, Clone, Default)]
pub struct StaticCharacterDirectory {
    profiles: BTreeMap<String, CharacterProfile>,
}

impl StaticCharacterDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a profile.
    pub fn insert(&mut self, character_id: impl Into<String>, profile: CharacterProfile) {
        self.profiles.insert(character_id.into(), profile);
    }
}

impl CharacterDirectory for StaticCharacterDirectory {
    fn fetch(&self, character_id: &str) -> BoxFuture<'_, Result<Option<CharacterProfile>, RosterError>> {
        future::ready(Ok(self.profiles.get(character_id).cloned())).boxed()
    }
}

/// Look up one character. Failures are logged and yield no profile.
pub async fn lookup_character(
    directory: &dyn CharacterDirectory,
    user_id: &str,
    character_id: &str,
) -> Option<CharacterProfile> {
    match directory.fetch(character_id).await {
        Ok(profile) => profile,
        Err(e) => {
            warn!(user = %user_id, character = %character_id, error = %e, "character lookup failed");
            None
        }
    }
}
