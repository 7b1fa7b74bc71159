//! Veil - development host daemon
//!
//! Runs the Veil core over the in-process loopback bus and serves it on a
//! Unix socket, one client per connection.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nyx_veil::bus::{Bus, Loopback};
use nyx_veil::config::VeilConfig;
use nyx_veil::device::Device;
use nyx_veil::ipc::{VeilServer, VeilState};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Veil - foreign-domain memory and event bridge
#[derive(Parser, Debug)]
#[command(name = "veild", version, about)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/veil/veil.toml", env = "VEIL_CONFIG")]
    config: PathBuf,

    /// Socket path (overrides the configuration)
    #[arg(long)]
    socket: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = VeilConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    // Initialize logging
    let log_level = if args.debug {
        "debug".to_string()
    } else {
        config.daemon.log_level.clone()
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::new(log_level))
        .init();

    info!("Starting Veil daemon v{}", VERSION);

    let loopback = Arc::new(Loopback::from_config(&config.loopback));
    info!(
        "loopback bus as dom{} ({} processors, {} page budget)",
        config.loopback.domain_id,
        loopback.processors(),
        config.loopback.memory_limit_pages
    );

    let device = Device::new(Bus::loopback(loopback.clone()), &config.device)
        .context("device initialization failed")?;
    let state = Arc::new(VeilState::new(device, loopback));

    let socket = args.socket.unwrap_or(config.daemon.socket_path);
    let server = VeilServer::new(&socket, state);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
