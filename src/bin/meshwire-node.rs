//! Meshwire node daemon
//!
//! Loads a JSON configuration, starts the node and runs until Ctrl+C.

use clap::Parser;
use meshwire::api::NodeBuilder;
use meshwire::storage::{load_config, save_config, NodeConfig};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Meshwire overlay node
#[derive(Parser, Debug)]
#[command(name = "meshwire-node", version, about)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE", default_value = "meshwire-config.json")]
    config: PathBuf,

    /// Write a fresh configuration with a new identity to the config path and exit
    #[arg(long)]
    gen_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.gen_config {
        let config = NodeConfig::generate();
        if let Err(e) = save_config(&args.config, &config) {
            eprintln!("Failed to write {}: {}", args.config.display(), e);
            std::process::exit(1);
        }
        println!(
            "Wrote {} for node {}",
            args.config.display(),
            config.node.local_pk
        );
        return;
    }

    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration from {}: {}", args.config.display(), e);
            std::process::exit(1);
        },
    };

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    fmt().with_env_filter(filter).with_target(true).init();

    info!(path = %args.config.display(), "Loaded config file");
    info!(local = %config.node.local_pk, "Creating node");

    let node = match NodeBuilder::new(config).build().await {
        Ok(node) => node,
        Err(e) => {
            error!("Failed to create node: {}", e);
            std::process::exit(1);
        },
    };

    if let Err(e) = node.start().await {
        error!("Failed to start node: {}", e);
        let _ = node.close().await;
        std::process::exit(1);
    }

    if let Some(addr) = node.tcp_addr() {
        info!(address = %addr, "Accepting transports");
    }
    if let Some(addr) = node.apps_addr() {
        info!(address = %addr, "Accepting apps");
    }
    info!("Meshwire running, press Ctrl+C to exit");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    if let Err(e) = node.close().await {
        warn!("Error during shutdown: {}", e);
    }
    info!("Meshwire shutdown complete");
}
