//! ChainSync mini-protocol (id 2): one-shot intersect query.
//!
//! The client sends `MsgFindIntersect = [4, points]` with an empty point
//! list and expects a single reply, either `MsgIntersectFound = [5, point,
//! tip]` or `MsgIntersectNotFound = [6, tip]`. Both carry the producer's
//! tip as the last element, which is where we read it from: deployed
//! implementations disagree on which of 5/6 means found, the tip position
//! does not.

use crate::{MiniProtocolClient, NetworkError, NetworkResult};
use ouro_wire::Value;
use serde::Serialize;
use tracing::debug;

/// Mini-protocol id.
pub const PROTOCOL_ID: u16 = 2;

const TAG_FIND_INTERSECT: u64 = 4;
const TAG_INTERSECT_FOUND: u64 = 5;
const TAG_INTERSECT_NOT_FOUND: u64 = 6;

/// The producer's chain tip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Tip {
    /// The flat `[slot, 32-byte hash, blockNo]` wire shape.
    #[serde(rename_all = "camelCase")]
    Header {
        slot: u64,
        hash_hex: String,
        block_no: u64,
    },
    /// Any other shape, passed through as diagnostic text.
    Raw { raw: String },
}

/// Build `MsgFindIntersect` for a list of points.
pub fn find_intersect_message(points: Vec<Value>) -> Value {
    Value::Array(vec![Value::from(TAG_FIND_INTERSECT), Value::Array(points)])
}

/// Extract the tip from an intersect reply.
pub fn tip_from_reply(reply: &Value) -> NetworkResult<Tip> {
    let items = reply
        .as_array()
        .ok_or_else(|| protocol_error(format!("non-array reply: {}", reply.to_diagnostic())))?;
    let tag = items
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| protocol_error(format!("missing tag: {}", reply.to_diagnostic())))?;

    if tag != TAG_INTERSECT_FOUND && tag != TAG_INTERSECT_NOT_FOUND {
        return Err(protocol_error(format!("unexpected chain-sync tag {tag}")));
    }
    if items.len() < 2 {
        return Err(protocol_error("intersect reply without tip".to_string()));
    }

    // Last element regardless of tag
    Ok(parse_tip(&items[items.len() - 1]))
}

fn parse_tip(value: &Value) -> Tip {
    if let Some(items) = value.as_array() {
        if items.len() == 3 {
            if let (Some(slot), Some(hash), Some(block_no)) = (
                items[0].as_u64(),
                items[1].as_bytes(),
                items[2].as_u64(),
            ) {
                if hash.len() == 32 {
                    return Tip::Header {
                        slot,
                        hash_hex: hex::encode(hash),
                        block_no,
                    };
                }
            }
        }
    }
    Tip::Raw {
        raw: value.to_diagnostic(),
    }
}

/// Query the producer's tip with an empty-point intersect.
pub async fn query_tip(client: &mut MiniProtocolClient) -> NetworkResult<Tip> {
    let reply = client.request(&find_intersect_message(Vec::new())).await?;
    let tip = tip_from_reply(&reply)?;
    debug!(tip = ?tip, "Tip received");
    Ok(tip)
}

fn protocol_error(detail: String) -> NetworkError {
    NetworkError::Protocol {
        protocol: PROTOCOL_ID,
        detail,
    }
}
