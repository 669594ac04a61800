//! Segment demultiplexer and per-mini-protocol mailboxes.
//!
//! One reader task drains the framed socket and routes each decoded
//! payload to the mailbox registered for `(protocol id, mode)`; one writer
//! task serializes outbound segments and stamps their transmission time.
//! Mini-protocol machines never touch the socket, they talk to their
//! [`MiniProtocolClient`] handle only.
//!
//! Failure scoping: a payload that will not decode as CBOR arrives inside
//! an intact mux frame, so it poisons only the mini-protocol it was
//! addressed to; that protocol's mailbox closes with the decode error
//! while the others keep running. Transport and framing errors from the
//! socket itself end the whole session, every open mailbox closes with
//! the same cause.

use crate::{Connection, NetworkError, NetworkResult, TimeoutScope};
use futures::{SinkExt, StreamExt};
use ouro_wire::{cbor, Mode, SduCodec, Segment, Value, WireError, MAX_SEGMENT_PAYLOAD};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

/// Mailbox depth per mini-protocol. One in-flight request means one
/// pending reply, the headroom covers unsolicited trailing messages.
const MAILBOX_DEPTH: usize = 4;

/// Outbound queue depth shared by all mini-protocols.
const OUTBOUND_DEPTH: usize = 16;

type RouteMap = Arc<RwLock<HashMap<(u16, Mode), mpsc::Sender<Value>>>>;
type FaultMap = Arc<RwLock<HashMap<u16, NetworkError>>>;

/// Demultiplexer over one connection.
pub struct Demux {
    routes: RouteMap,
    faults: FaultMap,
    outbound_tx: mpsc::Sender<Segment>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl Demux {
    /// Take ownership of a connection and start the reader/writer tasks.
    pub fn start(connection: Connection) -> Self {
        let routes: RouteMap = Arc::new(RwLock::new(HashMap::new()));
        let faults: FaultMap = Arc::new(RwLock::new(HashMap::new()));
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_DEPTH);

        let reader_task = tokio::spawn(reader_loop(
            connection.reader,
            routes.clone(),
            faults.clone(),
        ));
        let writer_task = tokio::spawn(writer_loop(connection.writer, outbound_rx));

        Self {
            routes,
            faults,
            outbound_tx,
            reader_task,
            writer_task,
        }
    }

    /// Register a client handle for a mini-protocol. Inbound responder
    /// segments for `protocol_id` flow into the returned handle.
    pub fn register(&self, protocol_id: u16, timeout: Duration) -> MiniProtocolClient {
        let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
        self.routes
            .write()
            .insert((protocol_id, Mode::Responder), tx);

        MiniProtocolClient {
            protocol_id,
            outbound: self.outbound_tx.clone(),
            inbound: rx,
            timeout,
            faults: self.faults.clone(),
        }
    }

    /// Drop the route for a mini-protocol. Later segments for it are
    /// discarded by the reader.
    pub fn unregister(&self, protocol_id: u16) {
        self.routes.write().remove(&(protocol_id, Mode::Responder));
    }

    /// Abort handles for the socket tasks, so an outer deadline can tear
    /// them down after this handle is gone.
    pub fn abort_handles(&self) -> [AbortHandle; 2] {
        [
            self.reader_task.abort_handle(),
            self.writer_task.abort_handle(),
        ]
    }

    /// Stop both tasks and close the socket.
    pub fn shutdown(self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

/// Client-side handle for one mini-protocol.
pub struct MiniProtocolClient {
    protocol_id: u16,
    outbound: mpsc::Sender<Segment>,
    inbound: mpsc::Receiver<Value>,
    timeout: Duration,
    faults: FaultMap,
}

impl MiniProtocolClient {
    /// Encode and queue one initiator message. The payload-size check
    /// happens here, before anything reaches the socket, so an oversize
    /// message fails without disturbing the connection.
    pub async fn send(&self, message: &Value) -> NetworkResult<()> {
        let payload = cbor::encode(message)?;
        if payload.len() > MAX_SEGMENT_PAYLOAD {
            return Err(WireError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_SEGMENT_PAYLOAD,
            }
            .into());
        }

        let segment = Segment::new(self.protocol_id, Mode::Initiator, payload.into());
        self.outbound
            .send(segment)
            .await
            .map_err(|_| NetworkError::ConnectionClosed)
    }

    /// Await the next responder message for this mini-protocol.
    pub async fn recv(&mut self) -> NetworkResult<Value> {
        match tokio::time::timeout(self.timeout, self.inbound.recv()).await {
            Err(_) => Err(NetworkError::Timeout(TimeoutScope::Protocol(
                self.protocol_id,
            ))),
            Ok(Some(value)) => Ok(value),
            // Mailbox closed: surface this protocol's recorded fault
            Ok(None) => Err(self
                .faults
                .write()
                .remove(&self.protocol_id)
                .unwrap_or(NetworkError::ConnectionClosed)),
        }
    }

    /// One request/response exchange. Each client keeps at most one
    /// request in flight.
    pub async fn request(&mut self, message: &Value) -> NetworkResult<Value> {
        self.send(message).await?;
        self.recv().await
    }

    /// Mini-protocol id this handle serves.
    pub fn protocol_id(&self) -> u16 {
        self.protocol_id
    }
}

async fn reader_loop(
    mut reader: FramedRead<OwnedReadHalf, SduCodec>,
    routes: RouteMap,
    faults: FaultMap,
) {
    loop {
        match reader.next().await {
            Some(Ok(segment)) => {
                let key = (segment.protocol_id, segment.mode);
                // Clone the sender before releasing the lock to avoid
                // holding it across await
                let tx = match routes.read().get(&key).cloned() {
                    Some(tx) => tx,
                    None => {
                        debug!(
                            mpid = segment.protocol_id,
                            mode = ?segment.mode,
                            "No route for segment, dropping"
                        );
                        continue;
                    }
                };

                match cbor::decode(&segment.payload) {
                    Ok(value) => {
                        debug!(
                            mpid = segment.protocol_id,
                            len = segment.payload.len(),
                            "Routed segment"
                        );
                        if tx.send(value).await.is_err() {
                            debug!(mpid = segment.protocol_id, "Mailbox closed, dropping");
                        }
                    }
                    Err(e) => {
                        // The frame itself was sound, so only the
                        // addressed mini-protocol is poisoned
                        warn!(
                            mpid = segment.protocol_id,
                            error = %e,
                            "Undecodable payload, closing mini-protocol"
                        );
                        faults.write().insert(segment.protocol_id, e.into());
                        routes.write().remove(&key);
                    }
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "Receive error, aborting session");
                // Record the cause for every open mini-protocol before
                // their mailboxes close
                let mut routes_guard = routes.write();
                let mut faults_guard = faults.write();
                for ((protocol_id, _), _) in routes_guard.iter() {
                    faults_guard.insert(*protocol_id, replicate_wire(&e).into());
                }
                routes_guard.clear();
                break;
            }
            None => {
                debug!("Connection closed by peer");
                break;
            }
        }
    }

    // Closing every mailbox wakes the machines blocked on recv
    routes.write().clear();
}

/// Rebuild a wire error so each affected mini-protocol reports the same
/// cause.
fn replicate_wire(error: &WireError) -> WireError {
    match error {
        WireError::PayloadTooLarge { size, max } => WireError::PayloadTooLarge {
            size: *size,
            max: *max,
        },
        WireError::Framing(detail) => WireError::Framing(detail.clone()),
        WireError::Cbor(detail) => WireError::Cbor(detail.clone()),
        WireError::Io(e) => WireError::Io(std::io::Error::new(e.kind(), e.to_string())),
    }
}

async fn writer_loop(
    mut writer: FramedWrite<OwnedWriteHalf, SduCodec>,
    mut outbound_rx: mpsc::Receiver<Segment>,
) {
    let epoch = Instant::now();

    while let Some(mut segment) = outbound_rx.recv().await {
        segment.transmission_time = epoch.elapsed().as_micros() as u32;
        if let Err(e) = writer.send(segment).await {
            warn!(error = %e, "Send error");
            break;
        }
    }
}
