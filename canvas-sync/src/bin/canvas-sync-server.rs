//! Standalone sync server.
//!
//! Configured through `CANVAS_SYNC_*` environment variables, logging through
//! `RUST_LOG` (default `info`).

use canvas_sync::server::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        log::error!("Sync server stopped: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), canvas_sync::ServerError> {
    let config = ServerConfig::from_env()?;
    let server = SyncServer::new(config)?;

    match server.persisted_rooms()?.as_slice() {
        [] => log::info!("Starting with no persisted rooms"),
        rooms => {
            let increments: u64 = rooms.iter().map(|room| room.increment_count).sum();
            log::info!("Found {} persisted rooms holding {increments} increments", rooms.len());
        }
    }

    server.run().await
}
