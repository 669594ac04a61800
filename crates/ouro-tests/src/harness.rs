//! Scripted relay for end-to-end session tests.
//!
//! The relay binds a local listener, accepts one connection, and answers
//! mini-protocol requests from a fixed script using the same mux/CBOR
//! codecs as a real peer. Every inbound segment's protocol id is recorded
//! so tests can assert what the client put on the wire.

use futures::{SinkExt, StreamExt};
use ouro_network::Endpoint;
use ouro_wire::{cbor, Mode, SduCodec, Segment, Value};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

/// How the relay answers the version proposal.
#[derive(Debug, Clone)]
pub enum HandshakeReply {
    /// `[1, version, data]`
    Accept { version: u64, data: Value },
    /// `[2, reason]`
    Refuse(Value),
    /// `[3, {}]`
    QueryReply,
}

/// What the relay does after the handshake.
#[derive(Debug, Clone)]
pub struct RelayScript {
    pub handshake: HandshakeReply,
    /// Full chain-sync reply array; `None` leaves the client waiting.
    pub tip_reply: Option<Value>,
    /// Full peer-sharing reply array; `None` ignores share requests.
    pub peers_reply: Option<Value>,
    /// Raw bytes sent instead of `peers_reply`, so tests can feed the
    /// client an undecodable peer-sharing payload.
    pub peers_reply_raw: Option<Vec<u8>>,
    /// Delay before the peer-sharing reply goes out.
    pub peers_delay: Option<Duration>,
}

impl RelayScript {
    /// Accept `version` and answer the intersect with `tip_reply`.
    pub fn accepting(version: u64, peer_sharing: bool, tip_reply: Value) -> Self {
        Self {
            handshake: HandshakeReply::Accept {
                version,
                data: version_data_value(ouro_network::MAINNET_MAGIC, peer_sharing),
            },
            tip_reply: Some(tip_reply),
            peers_reply: None,
            peers_reply_raw: None,
            peers_delay: None,
        }
    }
}

/// The v14/v15 version-data tuple as a relay would encode it.
pub fn version_data_value(magic: u32, peer_sharing: bool) -> Value {
    Value::Array(vec![
        Value::from(magic as u64),
        Value::from(false),
        Value::from(if peer_sharing { 1u64 } else { 0 }),
        Value::from(false),
    ])
}

/// A `[slot, hash, blockNo]` tip.
pub fn tip_value(slot: u64, hash: [u8; 32], block_no: u64) -> Value {
    Value::Array(vec![
        Value::from(slot),
        Value::Bytes(hash.to_vec()),
        Value::from(block_no),
    ])
}

/// `MsgIntersectNotFound` carrying `tip`.
pub fn intersect_not_found(tip: Value) -> Value {
    Value::Array(vec![Value::from(6u64), tip])
}

/// A relay running a [`RelayScript`].
pub struct ScriptedRelay {
    addr: SocketAddr,
    /// Protocol ids of every segment the client sent, in order.
    pub seen_protocols: Arc<Mutex<Vec<u16>>>,
    _serve_task: JoinHandle<()>,
}

impl ScriptedRelay {
    /// Bind a local listener and serve one connection with `script`.
    pub async fn spawn(script: RelayScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let serve_task = tokio::spawn(serve(listener, script, seen.clone()));

        Self {
            addr,
            seen_protocols: seen,
            _serve_task: serve_task,
        }
    }

    /// Endpoint the client should connect to.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1", self.addr.port())
    }
}

async fn serve(listener: TcpListener, script: RelayScript, seen: Arc<Mutex<Vec<u16>>>) {
    let (stream, _) = match listener.accept().await {
        Ok(accepted) => accepted,
        Err(_) => return,
    };

    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, SduCodec::new());
    let mut writer = FramedWrite::new(write_half, SduCodec::new());

    // Replies funnel through one queue so delayed sends cannot interleave
    // with prompt ones mid-frame
    let (reply_tx, mut reply_rx) = mpsc::channel::<Segment>(8);

    loop {
        tokio::select! {
            inbound = reader.next() => {
                let segment = match inbound {
                    Some(Ok(segment)) => segment,
                    _ => break,
                };
                seen.lock().push(segment.protocol_id);

                let message = cbor::decode(&segment.payload).unwrap();
                let tag = message
                    .as_array()
                    .and_then(|items| items.first())
                    .and_then(Value::as_u64);

                match (segment.protocol_id, tag) {
                    (0, Some(0)) => {
                        let reply = match &script.handshake {
                            HandshakeReply::Accept { version, data } => Value::Array(vec![
                                Value::from(1u64),
                                Value::from(*version),
                                data.clone(),
                            ]),
                            HandshakeReply::Refuse(reason) => {
                                Value::Array(vec![Value::from(2u64), reason.clone()])
                            }
                            HandshakeReply::QueryReply => {
                                Value::Array(vec![Value::from(3u64), Value::Map(vec![])])
                            }
                        };
                        reply_tx.send(responder_segment(0, &reply)).await.ok();
                    }
                    (2, Some(4)) => {
                        if let Some(reply) = &script.tip_reply {
                            reply_tx.send(responder_segment(2, reply)).await.ok();
                        }
                    }
                    (10, Some(0)) => {
                        let reply = if let Some(raw) = &script.peers_reply_raw {
                            Some(Segment::new(10, Mode::Responder, raw.clone().into()))
                        } else {
                            script
                                .peers_reply
                                .as_ref()
                                .map(|reply| responder_segment(10, reply))
                        };

                        if let Some(reply) = reply {
                            let tx = reply_tx.clone();
                            match script.peers_delay {
                                Some(delay) => {
                                    tokio::spawn(async move {
                                        tokio::time::sleep(delay).await;
                                        tx.send(reply).await.ok();
                                    });
                                }
                                None => {
                                    tx.send(reply).await.ok();
                                }
                            }
                        }
                    }
                    // MsgDone and anything unscripted are ignored
                    _ => {}
                }
            }
            outbound = reply_rx.recv() => {
                match outbound {
                    Some(segment) => {
                        if writer.send(segment).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
}

fn responder_segment(protocol_id: u16, message: &Value) -> Segment {
    Segment::new(
        protocol_id,
        Mode::Responder,
        cbor::encode(message).unwrap().into(),
    )
}
