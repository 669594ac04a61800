//! Handshake mini-protocol (id 0): version negotiation.
//!
//! The initiator opens every session by proposing a version table; the
//! responder answers with exactly one of:
//! - `MsgAcceptVersion = [1, version, versionData]`
//! - `MsgRefuse        = [2, reason]`
//! - `MsgQueryReply    = [3, versionTable]`
//!
//! Only an accept yields a usable session. The responder is authoritative
//! about the accepted version number, even one outside the proposed table;
//! a shape mismatch from such a choice surfaces later as a decode error in
//! the dependent protocols.

use crate::{MiniProtocolClient, NetworkError, NetworkResult};
use ouro_wire::Value;
use std::fmt;
use tracing::{debug, warn};

/// Mini-protocol id.
pub const PROTOCOL_ID: u16 = 0;

/// Node-to-node protocol versions this client speaks.
pub const NTN_V14: u64 = 14;
pub const NTN_V15: u64 = 15;

const TAG_PROPOSE: u64 = 0;
const TAG_ACCEPT: u64 = 1;
const TAG_REFUSE: u64 = 2;
const TAG_QUERY_REPLY: u64 = 3;

/// Version data carried by versions 14 and 15: an ordered 4-tuple of
/// network magic, diffusion mode, peer-sharing willingness, and query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionData {
    /// 32-bit network identifier.
    pub network_magic: u32,
    /// False means initiator-and-responder participation.
    pub diffusion_mode: bool,
    /// Willingness to exchange peer addresses.
    pub peer_sharing: bool,
    /// Version query flag, always false for a negotiating client.
    pub query: bool,
}

impl VersionData {
    /// Client version data: full-duplex participation, no query.
    pub fn client(network_magic: u32, peer_sharing: bool) -> Self {
        Self {
            network_magic,
            diffusion_mode: false,
            peer_sharing,
            query: false,
        }
    }

    fn to_value(self) -> Value {
        Value::Array(vec![
            Value::from(self.network_magic as u64),
            Value::from(self.diffusion_mode),
            Value::from(if self.peer_sharing { 1u64 } else { 0 }),
            Value::from(self.query),
        ])
    }

    fn from_value(value: &Value) -> Option<Self> {
        let items = value.as_array()?;
        if items.len() != 4 {
            return None;
        }
        Some(Self {
            network_magic: u32::try_from(items[0].as_u64()?).ok()?,
            diffusion_mode: items[1].as_bool()?,
            peer_sharing: items[2].as_u64()? == 1,
            query: items[3].as_bool()?,
        })
    }
}

/// Result of a successful negotiation.
#[derive(Debug, Clone)]
pub struct NegotiatedSession {
    /// Accepted version number.
    pub version: u64,
    /// Accepted version data, when it parses as the v14/v15 shape.
    pub data: Option<VersionData>,
}

/// Why the responder refused.
#[derive(Debug, Clone, PartialEq)]
pub enum RefuseReason {
    /// None of the proposed versions is supported; carries the
    /// responder's versions.
    VersionMismatch(Vec<u64>),
    /// The responder could not decode our proposal for `version`.
    DecodeError { version: u64, message: String },
    /// The responder rejected `version` for its own reasons.
    Refused { version: u64, message: String },
    /// Anything else, rendered as CBOR diagnostic text.
    Unknown(String),
}

impl fmt::Display for RefuseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefuseReason::VersionMismatch(versions) => {
                write!(f, "version mismatch, responder supports {versions:?}")
            }
            RefuseReason::DecodeError { version, message } => {
                write!(f, "proposal for version {version} undecodable: {message}")
            }
            RefuseReason::Refused { version, message } => {
                write!(f, "version {version} refused: {message}")
            }
            RefuseReason::Unknown(diag) => write!(f, "{diag}"),
        }
    }
}

/// Version table proposed by this client, in descending-preference order.
pub fn version_table(network_magic: u32, peer_sharing: bool) -> Vec<(u64, VersionData)> {
    let data = VersionData::client(network_magic, peer_sharing);
    vec![(NTN_V15, data), (NTN_V14, data)]
}

/// Build `MsgProposeVersions` for a version table.
pub fn propose_message(table: &[(u64, VersionData)]) -> Value {
    let entries = table
        .iter()
        .map(|(version, data)| (Value::from(*version), data.to_value()))
        .collect();
    Value::Array(vec![Value::from(TAG_PROPOSE), Value::Map(entries)])
}

/// Run the negotiation over an established connection.
pub async fn negotiate(
    client: &mut MiniProtocolClient,
    network_magic: u32,
    peer_sharing: bool,
) -> NetworkResult<NegotiatedSession> {
    let table = version_table(network_magic, peer_sharing);
    let proposal = propose_message(&table);
    debug!(versions = ?table.iter().map(|(v, _)| *v).collect::<Vec<_>>(), "Proposing versions");

    let reply = client.request(&proposal).await?;
    interpret_reply(&table, &reply)
}

/// Interpret the single responder message ending the handshake.
pub fn interpret_reply(
    table: &[(u64, VersionData)],
    reply: &Value,
) -> NetworkResult<NegotiatedSession> {
    let items = reply
        .as_array()
        .ok_or_else(|| unexpected(format!("non-array reply: {}", reply.to_diagnostic())))?;
    let tag = items
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| unexpected(format!("missing tag: {}", reply.to_diagnostic())))?;

    match tag {
        TAG_ACCEPT => {
            let version = items
                .get(1)
                .and_then(Value::as_u64)
                .ok_or_else(|| unexpected("accept without version number".to_string()))?;
            let data = items.get(2).and_then(VersionData::from_value);

            if !table.iter().any(|(v, _)| *v == version) {
                // The responder picks; a shape mismatch will surface later
                warn!(version, "Responder accepted an unproposed version");
            }
            if data.is_none() {
                debug!(version, "Accept carried unrecognized version data");
            }

            Ok(NegotiatedSession { version, data })
        }
        TAG_REFUSE => {
            let reason = items
                .get(1)
                .map(refuse_reason)
                .unwrap_or(RefuseReason::Unknown("no reason given".to_string()));
            Err(NetworkError::HandshakeRefused(reason.to_string()))
        }
        TAG_QUERY_REPLY => Err(unexpected(
            "responder answered a version query, no version negotiated".to_string(),
        )),
        other => Err(unexpected(format!("unknown handshake tag {other}"))),
    }
}

/// Decode a refuse reason, tolerating both numeric and text-tagged forms.
pub fn refuse_reason(value: &Value) -> RefuseReason {
    let fallback = || RefuseReason::Unknown(value.to_diagnostic());

    let items = match value.as_array() {
        Some(items) if !items.is_empty() => items,
        _ => return fallback(),
    };

    match items[0].as_u64() {
        Some(0) => {
            let versions = items
                .get(1)
                .and_then(Value::as_array)
                .map(|vs| vs.iter().filter_map(Value::as_u64).collect())
                .unwrap_or_default();
            RefuseReason::VersionMismatch(versions)
        }
        Some(1) => match (items.get(1).and_then(Value::as_u64), items.get(2)) {
            (Some(version), Some(msg)) => RefuseReason::DecodeError {
                version,
                message: msg.as_text().map(str::to_string).unwrap_or_else(|| msg.to_diagnostic()),
            },
            _ => fallback(),
        },
        Some(2) => match (items.get(1).and_then(Value::as_u64), items.get(2)) {
            (Some(version), Some(msg)) => RefuseReason::Refused {
                version,
                message: msg.as_text().map(str::to_string).unwrap_or_else(|| msg.to_diagnostic()),
            },
            _ => fallback(),
        },
        _ => fallback(),
    }
}

fn unexpected(detail: String) -> NetworkError {
    NetworkError::HandshakeUnexpected(detail)
}
