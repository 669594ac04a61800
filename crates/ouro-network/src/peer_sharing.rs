//! PeerSharing mini-protocol (id 10): optional peer address exchange.
//!
//! The client sends `MsgShareRequest = [0, amount]` and may receive
//! `MsgSharePeers = [1, peerAddresses]`. A relay that does not support
//! peer sharing, negotiated a version without it, or simply declines will
//! never answer; the caller treats that as an empty result, never as a
//! session failure.

use crate::{MiniProtocolClient, NetworkError, NetworkResult};
use ouro_wire::Value;
use serde::Serialize;
use tracing::debug;

/// Mini-protocol id.
pub const PROTOCOL_ID: u16 = 10;

/// Smallest share amount worth asking for.
pub const MIN_SHARE_AMOUNT: u8 = 8;

/// Largest share amount a relay will honor.
pub const MAX_SHARE_AMOUNT: u8 = 25;

const TAG_SHARE_REQUEST: u64 = 0;
const TAG_SHARE_PEERS: u64 = 1;
const TAG_DONE: u64 = 2;

/// A peer address shared by the responder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerAddress {
    /// Dotted-quad IPv4 or 8-group uncompressed IPv6 text.
    pub ip: String,
    /// TCP port.
    pub port: u16,
}

impl PeerAddress {
    /// From the wire form `[0, addr32, port]`.
    pub fn v4(addr: u32, port: u16) -> Self {
        let ip = format!(
            "{}.{}.{}.{}",
            (addr >> 24) & 0xFF,
            (addr >> 16) & 0xFF,
            (addr >> 8) & 0xFF,
            addr & 0xFF
        );
        Self { ip, port }
    }

    /// From the wire form `[1, w0, w1, w2, w3, port]`.
    pub fn v6(words: [u32; 4], port: u16) -> Self {
        let mut groups = Vec::with_capacity(8);
        for word in words {
            groups.push(format!("{:04x}", (word >> 16) & 0xFFFF));
            groups.push(format!("{:04x}", word & 0xFFFF));
        }
        Self {
            ip: groups.join(":"),
            port,
        }
    }
}

/// Build `MsgShareRequest`.
pub fn share_request_message(amount: u8) -> Value {
    Value::Array(vec![
        Value::from(TAG_SHARE_REQUEST),
        Value::from(amount as u64),
    ])
}

/// Build `MsgDone`.
pub fn done_message() -> Value {
    Value::Array(vec![Value::from(TAG_DONE)])
}

/// Decode a `MsgSharePeers` reply. A `MsgDone` from the responder counts
/// as zero peers; malformed entries are skipped.
pub fn peers_from_reply(reply: &Value) -> NetworkResult<Vec<PeerAddress>> {
    let items = reply
        .as_array()
        .ok_or_else(|| protocol_error(format!("non-array reply: {}", reply.to_diagnostic())))?;
    let tag = items
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| protocol_error(format!("missing tag: {}", reply.to_diagnostic())))?;

    if tag == TAG_DONE {
        return Ok(Vec::new());
    }
    if tag != TAG_SHARE_PEERS {
        return Err(protocol_error(format!("unexpected peer-sharing tag {tag}")));
    }

    let entries = items
        .get(1)
        .and_then(Value::as_array)
        .ok_or_else(|| protocol_error("share reply without address list".to_string()))?;

    let mut peers = Vec::with_capacity(entries.len());
    for entry in entries {
        match peer_from_entry(entry) {
            Some(peer) => peers.push(peer),
            None => debug!(entry = %entry.to_diagnostic(), "Skipping malformed peer entry"),
        }
    }
    Ok(peers)
}

fn peer_from_entry(entry: &Value) -> Option<PeerAddress> {
    let items = entry.as_array()?;
    let tag = items.first()?.as_u64()?;

    match (tag, items.len()) {
        (0, 3) => {
            let addr = u32::try_from(items[1].as_u64()?).ok()?;
            let port = u16::try_from(items[2].as_u64()?).ok()?;
            Some(PeerAddress::v4(addr, port))
        }
        (1, 6) => {
            let mut words = [0u32; 4];
            for (slot, item) in words.iter_mut().zip(&items[1..5]) {
                *slot = u32::try_from(item.as_u64()?).ok()?;
            }
            let port = u16::try_from(items[5].as_u64()?).ok()?;
            Some(PeerAddress::v6(words, port))
        }
        _ => None,
    }
}

/// Request up to `amount` peers and close the mini-protocol.
pub async fn collect_peers(
    client: &mut MiniProtocolClient,
    amount: u8,
) -> NetworkResult<Vec<PeerAddress>> {
    let amount = amount.clamp(MIN_SHARE_AMOUNT, MAX_SHARE_AMOUNT);
    let reply = client.request(&share_request_message(amount)).await?;
    let peers = peers_from_reply(&reply)?;

    if let Err(e) = client.send(&done_message()).await {
        debug!(error = %e, "Could not close peer sharing");
    }

    Ok(peers)
}

fn protocol_error(detail: String) -> NetworkError {
    NetworkError::Protocol {
        protocol: PROTOCOL_ID,
        detail,
    }
}
