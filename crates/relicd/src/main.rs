//! relicd - Reliquary artifact repository daemon
//!
//! This daemon stores content-addressed artifacts, maintains the derived
//! history indexes, and serves the card sync protocol to peers.

use clap::Parser;
use relicd::config::Config;
use relicd::server::Server;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("relicd=info".parse().unwrap()))
        .init();

    // Parse configuration
    let config = Config::parse();
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    info!(
        "relicd v{} - Reliquary Artifact Repository Daemon",
        env!("CARGO_PKG_VERSION")
    );

    // Create and run server
    match Server::new(config) {
        Ok(server) => {
            let server = Arc::new(server);
            let signal_server = server.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Received shutdown signal");
                signal_server.shutdown();
            });

            if let Err(e) = server.run().await {
                error!("Server error: {}", e);
                return ExitCode::FAILURE;
            }
        }
        Err(e) => {
            error!("Failed to initialize server: {}", e);
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}
