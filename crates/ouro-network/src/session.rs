//! Session orchestrator: connect, negotiate, fetch the tip, close.

use crate::{
    chainsync, handshake, peer_sharing, Connection, ConnectionConfig, Demux, Endpoint,
    NetworkError, NetworkResult, PeerAddress, Tip, TimeoutScope, MAINNET_MAGIC,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;
use tracing::{debug, info};

/// Extra time granted to a peer-sharing reply that races the tip.
const PEER_SHARE_GRACE: Duration = Duration::from_millis(250);

/// Probe options.
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Network identifier proposed during the handshake.
    pub network_magic: u32,
    /// Whether to signal peer-sharing willingness and request peers.
    pub want_peer_sharing: bool,
    /// How many peers to ask for.
    pub peer_share_count: u8,
    /// Connection timeouts.
    pub connection: ConnectionConfig,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            network_magic: MAINNET_MAGIC,
            want_peer_sharing: true,
            peer_share_count: 12,
            connection: ConnectionConfig::default(),
        }
    }
}

/// The record a successful probe produces.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TipReport {
    /// The relay that answered.
    pub peer: Endpoint,
    /// Accepted node-to-node version.
    pub negotiated_version: u64,
    /// The producer's tip.
    pub tip: Tip,
    /// Peers accumulated before the tip arrived.
    pub peers_discovered: Vec<PeerAddress>,
    /// Wall time from connect to tip.
    pub elapsed_ms: u64,
}

/// Probe one relay for its current chain tip.
///
/// Handshake refusal, a missing tip, and the session deadline are fatal;
/// peer-sharing failures only shrink `peers_discovered`.
pub async fn probe(endpoint: &Endpoint, options: &ProbeOptions) -> NetworkResult<TipReport> {
    let cleanup: Arc<Mutex<Vec<AbortHandle>>> = Arc::new(Mutex::new(Vec::new()));

    let result = tokio::time::timeout(
        options.connection.session_timeout,
        run_session(endpoint, options, cleanup.clone()),
    )
    .await
    .unwrap_or(Err(NetworkError::Timeout(TimeoutScope::Session)));

    // A timed-out session leaves its socket tasks behind
    for handle in cleanup.lock().drain(..) {
        handle.abort();
    }

    result
}

async fn run_session(
    endpoint: &Endpoint,
    options: &ProbeOptions,
    cleanup: Arc<Mutex<Vec<AbortHandle>>>,
) -> NetworkResult<TipReport> {
    let started = Instant::now();
    let connection = Connection::connect(endpoint, &options.connection).await?;
    let demux = Demux::start(connection);
    cleanup.lock().extend(demux.abort_handles());
    let protocol_timeout = options.connection.protocol_timeout;

    // Handshake runs alone; nothing else is registered until it accepts
    let mut hs_client = demux.register(handshake::PROTOCOL_ID, protocol_timeout);
    let session = match handshake::negotiate(
        &mut hs_client,
        options.network_magic,
        options.want_peer_sharing,
    )
    .await
    {
        Ok(session) => session,
        Err(e) => {
            demux.shutdown();
            return Err(e);
        }
    };
    drop(hs_client);
    demux.unregister(handshake::PROTOCOL_ID);
    info!(peer = %endpoint, version = session.version, "Handshake accepted");

    // Peer sharing is worthwhile only if both sides signalled it
    let responder_shares = session.data.map_or(true, |data| data.peer_sharing);
    let discovered: Arc<Mutex<Vec<PeerAddress>>> = Arc::new(Mutex::new(Vec::new()));
    let mut share_task = None;

    if options.want_peer_sharing && responder_shares {
        let mut ps_client = demux.register(peer_sharing::PROTOCOL_ID, protocol_timeout);
        let sink = discovered.clone();
        let amount = options.peer_share_count;
        let task = tokio::spawn(async move {
            match peer_sharing::collect_peers(&mut ps_client, amount).await {
                Ok(peers) => {
                    debug!(count = peers.len(), "Peers shared");
                    *sink.lock() = peers;
                }
                Err(e) => debug!(error = %e, "Peer sharing unavailable"),
            }
        });
        cleanup.lock().push(task.abort_handle());
        share_task = Some(task);
    }

    let mut cs_client = demux.register(chainsync::PROTOCOL_ID, protocol_timeout);
    let tip = match chainsync::query_tip(&mut cs_client).await {
        Ok(tip) => tip,
        Err(e) => {
            if let Some(task) = share_task {
                task.abort();
            }
            demux.shutdown();
            return Err(e);
        }
    };

    // The tip ends the session; give an in-flight peer reply a moment to land
    if let Some(mut task) = share_task {
        if tokio::time::timeout(PEER_SHARE_GRACE, &mut task).await.is_err() {
            task.abort();
        }
    }

    let peers_discovered = discovered.lock().clone();
    demux.shutdown();

    Ok(TipReport {
        peer: endpoint.clone(),
        negotiated_version: session.version,
        tip,
        peers_discovered,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}
