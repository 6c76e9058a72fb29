//! Server Configuration
//!
//! Defaults suit local development. `from_env` overrides them from
//! `SKIRMISH_*` variables, and auth settings come from `AUTH_*`.

use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::game::engine::MatchTimings;
use crate::network::auth::AuthConfig;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Sockets silent for longer than this are dropped.
    pub idle_timeout: Duration,
    /// Server version string.
    pub version: String,
    /// Spell catalog JSON.
    pub catalog_path: PathBuf,
    /// Room document opened at startup, if any.
    pub room_file: Option<PathBuf>,
    /// Deferred action delays.
    pub timings: MatchTimings,
    /// Accept raw user ids as join tokens when auth is unconfigured.
    pub allow_insecure_join: bool,
    /// Join token validation.
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            version: env!("CARGO_PKG_VERSION").to_string(),
            catalog_path: PathBuf::from("data/spells.json"),
            room_file: None,
            timings: MatchTimings::default(),
            allow_insecure_join: false,
            auth: AuthConfig::default(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A variable is set but does not parse.
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidValue {
        /// Variable name.
        var: String,
        /// Raw value.
        value: String,
        /// Parser message.
        reason: String,
    },
}

impl ServerConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::from_lookup(|name| std::env::var(name).ok())?;
        config.auth = AuthConfig::from_env();
        Ok(config)
    }

    /// Defaults overridden by `lookup`. Auth settings are left at default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = parse_var(&lookup, "SKIRMISH_BIND_ADDR")? {
            config.bind_addr = addr;
        }
        if let Some(max) = parse_var(&lookup, "SKIRMISH_MAX_CONNECTIONS")? {
            config.max_connections = max;
        }
        if let Some(secs) = parse_var(&lookup, "SKIRMISH_IDLE_TIMEOUT_SECS")? {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(path) = lookup("SKIRMISH_SPELL_CATALOG") {
            config.catalog_path = PathBuf::from(path);
        }
        config.room_file = lookup("SKIRMISH_ROOM_FILE").filter(|p| !p.is_empty()).map(PathBuf::from);
        if let Some(ms) = parse_var(&lookup, "SKIRMISH_PATH_CLEAR_DELAY_MS")? {
            config.timings.path_clear_delay_ms = ms;
        }
        if let Some(ms) = parse_var(&lookup, "SKIRMISH_STATS_DISPOSE_DELAY_MS")? {
            config.timings.stats_dispose_delay_ms = ms;
        }
        if let Some(flag) = lookup("SKIRMISH_ALLOW_INSECURE_JOIN") {
            config.allow_insecure_join = parse_flag("SKIRMISH_ALLOW_INSECURE_JOIN", &flag)?;
        }

        Ok(config)
    }
}

fn parse_var<F, T>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    value.trim().parse::<T>().map(Some).map_err(|e| ConfigError::InvalidValue {
        var: var.to_string(),
        value,
        reason: e.to_string(),
    })
}

fn parse_flag(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var: var.to_string(),
            value: value.to_string(),
            reason: "expected a boolean".into(),
        }),
    }
}
