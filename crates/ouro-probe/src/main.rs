//! ouro-probe - query a Cardano relay for its chain tip.
//!
//! Connects to a node-to-node relay, negotiates a protocol version,
//! requests peer addresses on the side, fetches the producer's tip with an
//! empty-point intersect, and prints one JSON record.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod config;

use config::ProbeConfig;

/// Cardano node-to-node chain tip probe.
#[derive(Parser, Debug)]
#[command(name = "ouro-probe")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "ouro-probe.toml")]
    config: PathBuf,

    /// Relay endpoint to probe (host[:port]); may be given more than once
    #[arg(short, long = "relay")]
    relays: Vec<String>,

    /// Network magic to propose
    #[arg(long)]
    network_magic: Option<u32>,

    /// Do not request peer addresses
    #[arg(long)]
    no_peer_sharing: bool,

    /// Connect timeout in milliseconds
    #[arg(long)]
    connect_timeout_ms: Option<u64>,

    /// Session timeout in milliseconds
    #[arg(long)]
    session_timeout_ms: Option<u64>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting ouro-probe v{}", env!("CARGO_PKG_VERSION"));

    let config = ProbeConfig::load(&args.config, &args)?;
    let endpoints = config.endpoints()?;
    let options = config.options();

    info!(magic = config.network_magic, relays = endpoints.len(), "Configured");

    for endpoint in &endpoints {
        info!(relay = %endpoint, "Probing relay");
        match ouro_network::probe(endpoint, &options).await {
            Ok(report) => {
                info!(
                    relay = %endpoint,
                    version = report.negotiated_version,
                    peers = report.peers_discovered.len(),
                    elapsed_ms = report.elapsed_ms,
                    "Tip received"
                );
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }
            Err(e) => warn!(relay = %endpoint, error = %e, "Probe failed"),
        }
    }

    anyhow::bail!("No relay produced a tip ({} tried)", endpoints.len())
}
