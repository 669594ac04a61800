//! Network error types.

use ouro_wire::WireError;
use std::fmt;
use thiserror::Error;

/// Which deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutScope {
    /// TCP connect did not complete in time.
    Connect,
    /// The whole session produced no tip in time.
    Session,
    /// A single mini-protocol exchange stalled.
    Protocol(u16),
}

impl fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutScope::Connect => write!(f, "connect"),
            TimeoutScope::Session => write!(f, "session"),
            TimeoutScope::Protocol(id) => write!(f, "protocol {id}"),
        }
    }
}

/// Errors produced by the node-to-node client.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// DNS failure, refused, or unreachable peer.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The peer closed the connection.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The responder refused every proposed version.
    #[error("Handshake refused: {0}")]
    HandshakeRefused(String),

    /// The responder answered with something other than Accept or Refuse.
    #[error("Handshake failed: {0}")]
    HandshakeUnexpected(String),

    /// Unexpected message id or ordering inside a mini-protocol.
    #[error("Protocol {protocol} error: {detail}")]
    Protocol { protocol: u16, detail: String },

    /// A deadline expired.
    #[error("Timeout: {0}")]
    Timeout(TimeoutScope),

    /// Framing, CBOR, or payload-size failure.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Underlying socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
