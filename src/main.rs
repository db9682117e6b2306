//! RS2 Engine Server
//!
//! Starts the engine and reactor with no game content and runs until
//! Ctrl-C.

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rs2_engine::{NoContent, Server, ServerConfig, VERSION};

fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ServerConfig::from_env().context("invalid configuration")?;
    info!("{} v{}", config.server_name, VERSION);
    info!("Bind: {}", config.bind_addr);
    info!("Tick period: {:?} ({:?} overrun policy)", config.tick_period, config.overrun_policy);
    info!("Revision: {}", config.revision);

    let mut server = Server::new(config, NoContent);
    server.start().context("failed to start server")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for Ctrl-C")?;

    info!("Ctrl-C received");
    server.shutdown();
    Ok(())
}
