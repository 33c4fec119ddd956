//! tandem-rooms: one gateway node.
//!
//! Environment:
//! - `TANDEM_BIND_ADDR`, `TANDEM_PATH`, `TANDEM_CHANNEL`, `TANDEM_IDLE_TIMEOUT_SECS`
//! - `TANDEM_REDIS_URL`: Redis server shared by the cluster
//! - `TANDEM_STORE_ADDR`: shared `tandem-store`, used when no Redis URL is
//!   set; without either the node runs alone on an in-process store
//! - `RUST_LOG`: log filter

use std::sync::Arc;

use tandem_rooms::{
    CoordinationStore, MemoryStore, RedisStore, RemoteStore, RoomServer, ServerConfig, StoreError,
};

async fn open_store() -> Result<Arc<dyn CoordinationStore>, StoreError> {
    if let Ok(url) = std::env::var("TANDEM_REDIS_URL") {
        log::info!("Using Redis coordination store");
        return Ok(Arc::new(RedisStore::connect(&url).await?));
    }
    if let Ok(addr) = std::env::var("TANDEM_STORE_ADDR") {
        log::info!("Using coordination store at {addr}");
        return Ok(Arc::new(RemoteStore::connect(addr).await?));
    }
    log::info!("No shared store configured, running single node");
    Ok(Arc::new(MemoryStore::default()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::from_env();
    let store = open_store().await?;

    let server = RoomServer::with_store(config, store);
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted, leaving all rooms");
            server.shutdown().await;
        }
    }
    Ok(())
}
