//! # ouro-network
//!
//! Client side of the Cardano node-to-node wire stack.
//!
//! This crate provides:
//! - TCP connections framed with the mux segment codec
//! - A segment demultiplexer feeding per-mini-protocol mailboxes
//! - The Handshake, ChainSync, and PeerSharing client machines
//! - A session orchestrator that probes one relay for its chain tip

pub mod chainsync;
mod connection;
mod demux;
mod error;
pub mod handshake;
pub mod peer_sharing;
mod session;

pub use chainsync::Tip;
pub use connection::{Connection, ConnectionConfig, Endpoint};
pub use demux::{Demux, MiniProtocolClient};
pub use error::{NetworkError, NetworkResult, TimeoutScope};
pub use handshake::{NegotiatedSession, VersionData};
pub use peer_sharing::PeerAddress;
pub use session::{probe, ProbeOptions, TipReport};

/// Conventional node-to-node relay port.
pub const DEFAULT_PORT: u16 = 3001;

/// Network magic for the Cardano mainnet.
pub const MAINNET_MAGIC: u32 = 764_824_073;
