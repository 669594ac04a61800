//! Connection handling.

use crate::{NetworkError, NetworkResult, TimeoutScope};
use ouro_wire::SduCodec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

/// A relay endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or IP literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` string, falling back to `default_port` when the
    /// port is omitted. Bracketed IPv6 literals are accepted.
    pub fn parse(addr: &str, default_port: u16) -> Option<Self> {
        let addr = addr.trim();
        if addr.is_empty() {
            return None;
        }

        if let Some(rest) = addr.strip_prefix('[') {
            // [v6]:port or [v6]
            let (host, tail) = rest.split_once(']')?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().ok()?,
                None if tail.is_empty() => default_port,
                None => return None,
            };
            return Some(Self::new(host, port));
        }

        match addr.rsplit_once(':') {
            // A second colon means a bare IPv6 literal, not host:port
            Some((host, port)) if !host.contains(':') => {
                Some(Self::new(host, port.parse().ok()?))
            }
            Some(_) => Some(Self::new(addr, default_port)),
            None => Some(Self::new(addr, default_port)),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Deadline for the whole probe session.
    pub session_timeout: Duration,
    /// Deadline for a single mini-protocol exchange.
    pub protocol_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            session_timeout: Duration::from_secs(15),
            protocol_timeout: Duration::from_secs(12),
        }
    }
}

/// A live node-to-node connection, framed with the segment codec.
pub struct Connection {
    pub(crate) reader: FramedRead<OwnedReadHalf, SduCodec>,
    pub(crate) writer: FramedWrite<OwnedWriteHalf, SduCodec>,
}

impl Connection {
    /// Connect to a relay.
    pub async fn connect(endpoint: &Endpoint, config: &ConnectionConfig) -> NetworkResult<Self> {
        let stream = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| NetworkError::Timeout(TimeoutScope::Connect))?
        .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;

        stream.set_nodelay(true).ok();
        debug!(peer = %endpoint, "Connected");

        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: FramedRead::new(read_half, SduCodec::new()),
            writer: FramedWrite::new(write_half, SduCodec::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_PORT;

    #[test]
    fn test_connection_config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.session_timeout, Duration::from_secs(15));
        assert_eq!(config.protocol_timeout, Duration::from_secs(12));
    }

    #[test]
    fn test_parse_endpoint() {
        let ep = Endpoint::parse("relay.example.com:3001", DEFAULT_PORT).unwrap();
        assert_eq!(ep.host, "relay.example.com");
        assert_eq!(ep.port, 3001);

        // Default port applied
        let ep = Endpoint::parse("relay.example.com", DEFAULT_PORT).unwrap();
        assert_eq!(ep.port, DEFAULT_PORT);

        let ep = Endpoint::parse("[2001:db8::1]:3002", DEFAULT_PORT).unwrap();
        assert_eq!(ep.host, "2001:db8::1");
        assert_eq!(ep.port, 3002);

        let ep = Endpoint::parse("2001:db8::1", DEFAULT_PORT).unwrap();
        assert_eq!(ep.host, "2001:db8::1");
        assert_eq!(ep.port, DEFAULT_PORT);

        assert!(Endpoint::parse("", DEFAULT_PORT).is_none());
        assert!(Endpoint::parse("host:notaport", DEFAULT_PORT).is_none());
    }
}
