//! Inkpad relay server.
//!
//! Configuration comes from the environment (`PORT`, `INKPAD_BIND`,
//! `INKPAD_DATA_DIR`, `INKPAD_SAVE_DEBOUNCE_MS`, `INKPAD_MAX_PARTICIPANTS`,
//! `INKPAD_HEARTBEAT_SECS`). Log level follows `RUST_LOG`, default `info`.

use inkpad_collab::server::{BoxError, ServerConfig, SyncServer};
use log::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    match &config.storage_path {
        Some(path) => info!("Starting Inkpad relay with storage at {}", path.display()),
        None => warn!("INKPAD_DATA_DIR not set; documents are kept in memory only"),
    }

    let server = SyncServer::new(config)?;
    tokio::select! {
        result = server.run() => {
            if let Err(e) = &result {
                error!("Server stopped: {e}");
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    let failed = server.rooms().flush_all().await;
    if failed > 0 {
        warn!("{failed} rooms could not be saved on shutdown");
    }
    Ok(())
}
