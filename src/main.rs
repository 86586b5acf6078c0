//! Daemon entry point: opens the control channel and serves until
//! interrupted.

use panel_link::config::Config;
use panel_link::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        buffer_size = config.buffer_size,
        "Starting panel-link"
    );

    let server = Server::new();
    if !server.open(&config.host, config.port, config.buffer_size) {
        error!(host = %config.host, port = config.port, "Could not open control channel");
        return Err("could not open control channel".into());
    }

    // The default consumer echoes inbound text back to the peer, which is
    // the whole job of the standalone daemon. Embedders call subscribe()
    // and route text themselves.
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    server.shutdown().await;
    Ok(())
}
