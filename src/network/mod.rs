//! Network Layer
//!
//! WebSocket server, join authentication and per-match session tasks.
//! This layer is **non-deterministic**; every rule lives in `game/`.

pub mod auth;
pub mod protocol;
pub mod roster;
pub mod session;
pub mod server;

pub use auth::{authenticate, AuthConfig, AuthError, TokenClaims, validate_token};
pub use protocol::{ClientMessage, ErrorCode, GameStateMessage, ServerMessage};
pub use roster::{CharacterDirectory, RoomDocument, RosterError, RosterMember, StaticCharacterDirectory};
pub use session::{MatchCommand, MatchHandle, SessionError, SessionManager};
pub use server::{GameServer, GameServerError};
