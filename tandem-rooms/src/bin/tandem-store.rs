//! tandem-store: coordination store shared by gateway nodes.
//!
//! Binds `TANDEM_STORE_BIND` (default `127.0.0.1:6380`).

use std::sync::Arc;

use tandem_rooms::{MemoryStore, StoreServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let bind_addr =
        std::env::var("TANDEM_STORE_BIND").unwrap_or_else(|_| "127.0.0.1:6380".to_string());
    let server = StoreServer::new(Arc::new(MemoryStore::default()));

    tokio::select! {
        result = server.run(&bind_addr) => result?,
        _ = tokio::signal::ctrl_c() => log::info!("Coordination store stopped"),
    }
    Ok(())
}
