//! Probe configuration.

use crate::Args;
use anyhow::{Context, Result};
use ouro_network::{ConnectionConfig, Endpoint, ProbeOptions, DEFAULT_PORT, MAINNET_MAGIC};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Complete probe configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Relay endpoints to try, in order.
    #[serde(default = "default_relays")]
    pub relays: Vec<String>,
    /// Network magic proposed during the handshake.
    #[serde(default = "default_network_magic")]
    pub network_magic: u32,
    /// Request peer addresses alongside the tip.
    #[serde(default = "default_true")]
    pub peer_sharing: bool,
    /// How many peers to ask for (8..=25).
    #[serde(default = "default_peer_share_count")]
    pub peer_share_count: u8,
    /// TCP connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Whole-session deadline in milliseconds.
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    /// Per-mini-protocol deadline in milliseconds.
    #[serde(default = "default_protocol_timeout_ms")]
    pub protocol_timeout_ms: u64,
}

fn default_relays() -> Vec<String> {
    vec![
        "backbone.cardano.iog.io:3001".to_string(),
        "relays-new.cardano-mainnet.iohk.io:3001".to_string(),
        "backbone.mainnet.emurgornd.com:3001".to_string(),
    ]
}

fn default_network_magic() -> u32 {
    MAINNET_MAGIC
}

fn default_true() -> bool {
    true
}

fn default_peer_share_count() -> u8 {
    12
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_session_timeout_ms() -> u64 {
    15_000
}

fn default_protocol_timeout_ms() -> u64 {
    12_000
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            relays: default_relays(),
            network_magic: default_network_magic(),
            peer_sharing: true,
            peer_share_count: default_peer_share_count(),
            connect_timeout_ms: default_connect_timeout_ms(),
            session_timeout_ms: default_session_timeout_ms(),
            protocol_timeout_ms: default_protocol_timeout_ms(),
        }
    }
}

impl ProbeConfig {
    /// Load configuration from file and CLI args.
    pub fn load(config_path: &Path, args: &Args) -> Result<Self> {
        let mut config = if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            Self::default()
        };

        // Override with CLI args
        if !args.relays.is_empty() {
            config.relays = args.relays.clone();
        }
        if let Some(magic) = args.network_magic {
            config.network_magic = magic;
        }
        if args.no_peer_sharing {
            config.peer_sharing = false;
        }
        if let Some(ms) = args.connect_timeout_ms {
            config.connect_timeout_ms = ms;
        }
        if let Some(ms) = args.session_timeout_ms {
            config.session_timeout_ms = ms;
        }

        Ok(config)
    }

    /// Parse the configured relay list; entries without a port get 3001.
    pub fn endpoints(&self) -> Result<Vec<Endpoint>> {
        let mut endpoints = Vec::with_capacity(self.relays.len());
        for relay in &self.relays {
            match Endpoint::parse(relay, DEFAULT_PORT) {
                Some(endpoint) => endpoints.push(endpoint),
                None => warn!(relay = %relay, "Skipping unparseable relay address"),
            }
        }
        if endpoints.is_empty() {
            anyhow::bail!("No usable relay endpoints configured");
        }
        Ok(endpoints)
    }

    /// Session options derived from this configuration.
    pub fn options(&self) -> ProbeOptions {
        ProbeOptions {
            network_magic: self.network_magic,
            want_peer_sharing: self.peer_sharing,
            peer_share_count: self.peer_share_count,
            connection: ConnectionConfig {
                connect_timeout: Duration::from_millis(self.connect_timeout_ms),
                session_timeout: Duration::from_millis(self.session_timeout_ms),
                protocol_timeout: Duration::from_millis(self.protocol_timeout_ms),
            },
        }
    }
}
