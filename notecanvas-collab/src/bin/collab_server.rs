use std::path::PathBuf;

use log::info;
use notecanvas_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut config = ServerConfig::default();
    if let Ok(addr) = std::env::var("COLLAB_BIND_ADDR") {
        config.bind_addr = addr;
    }
    if let Ok(path) = std::env::var("COLLAB_STORAGE_PATH") {
        config.storage_path = Some(PathBuf::from(path));
    }

    info!(
        "Starting collab server on {} ({})",
        config.bind_addr,
        match &config.storage_path {
            Some(path) => format!("storage at {}", path.display()),
            None => "in-memory".to_string(),
        }
    );

    let server = SyncServer::new(config)?;
    server.run().await
}
