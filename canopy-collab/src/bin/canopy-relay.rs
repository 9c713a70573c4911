//! Relay server binary.
//!
//! Usage: `canopy-relay [BIND_ADDR]` (default `127.0.0.1:9090`).
//! Log level follows `RUST_LOG`.

use canopy_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let mut config = ServerConfig::default();
    if let Some(addr) = std::env::args().nth(1) {
        config.bind_addr = addr;
    }
    log::info!(
        "Starting canopy relay (max {} peers per room)",
        config.max_peers_per_room
    );
    SyncServer::new(config).run().await
}
