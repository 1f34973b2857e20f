//! ScriptDojo collaboration server.
//!
//! Configuration comes from `DOJO_*` environment variables on top of the
//! defaults; log output is controlled by `RUST_LOG`.

use dojo_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::default().from_env();
    log::info!(
        "Starting dojo-server on {} (checkpoints: {})",
        config.bind_addr,
        config
            .storage_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "disabled".into())
    );

    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            log::error!("Failed to start: {e}");
            std::process::exit(1);
        }
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Cannot listen for shutdown signal: {e}");
            std::future::pending::<()>().await;
        }
    };
    if let Err(e) = server.run_until(shutdown).await {
        log::error!("Server stopped: {e}");
        std::process::exit(1);
    }
}
