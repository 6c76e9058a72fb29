//! Skirmish Match Server
//!
//! Loads the spell catalog and an optional room file, then serves matches
//! over WebSocket until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use skirmish::network::{GameServer, RoomDocument, StaticCharacterDirectory};
use skirmish::{ServerConfig, SpellCatalog, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Skirmish Server v{}", VERSION);

    let config = ServerConfig::from_env().context("reading configuration")?;
    if !config.auth.is_configured() {
        if config.allow_insecure_join {
            warn!("Join tokens are not verified; raw user ids are accepted");
        } else {
            warn!("No AUTH_SECRET or AUTH_PUBLIC_KEY_PEM set; every join will be refused");
        }
    }

    let catalog = SpellCatalog::load(&config.catalog_path)
        .with_context(|| format!("loading spell catalog {}", config.catalog_path.display()))?;
    info!("Loaded {} spells from {}", catalog.len(), config.catalog_path.display());

    let room = match &config.room_file {
        Some(path) => Some(
            RoomDocument::load(path).with_context(|| format!("loading room file {}", path.display()))?,
        ),
        None => None,
    };

    let server = Arc::new(GameServer::new(
        config,
        Arc::new(catalog),
        Arc::new(StaticCharacterDirectory::new()),
    ));

    if let Some(room) = room {
        let handle = server.open_room(&room).await.context("opening room")?;
        info!("Room {} ready for {} players", handle.match_id(), room.roster.len());
    }

    let signal_server = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            signal_server.shutdown();
        }
    });

    server.run().await?;
    info!("Server stopped");
    Ok(())
}
