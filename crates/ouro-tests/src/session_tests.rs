//! End-to-end probe sessions against the scripted relay.

use crate::harness::*;
use ouro_network::{
    chainsync, handshake, probe, Connection, ConnectionConfig, Demux, NetworkError, ProbeOptions,
    Tip, TimeoutScope,
};
use ouro_wire::Value;
use std::time::Duration;

fn fast_options() -> ProbeOptions {
    ProbeOptions {
        connection: ConnectionConfig {
            connect_timeout: Duration::from_secs(2),
            session_timeout: Duration::from_secs(5),
            protocol_timeout: Duration::from_secs(3),
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_handshake_and_tip_via_empty_intersect() {
    let relay = ScriptedRelay::spawn(RelayScript::accepting(
        14,
        false,
        intersect_not_found(tip_value(142_857_142, [0u8; 32], 9_999_999)),
    ))
    .await;

    let report = probe(&relay.endpoint(), &fast_options()).await.unwrap();

    assert_eq!(report.negotiated_version, 14);
    assert_eq!(
        report.tip,
        Tip::Header {
            slot: 142_857_142,
            hash_hex: "0".repeat(64),
            block_no: 9_999_999,
        }
    );
    assert!(report.peers_discovered.is_empty());

    // The responder declined peer sharing, so no share request was sent
    assert!(!relay.seen_protocols.lock().contains(&10));
}

#[tokio::test]
async fn test_handshake_refused() {
    let reason = Value::Array(vec![
        Value::Text("VersionMismatch".into()),
        Value::Array(vec![Value::from(15u64), Value::from(14u64)]),
    ]);
    let relay = ScriptedRelay::spawn(RelayScript {
        handshake: HandshakeReply::Refuse(reason),
        tip_reply: None,
        peers_reply: None,
        peers_reply_raw: None,
        peers_delay: None,
    })
    .await;

    let err = probe(&relay.endpoint(), &fast_options()).await.unwrap_err();
    assert!(matches!(err, NetworkError::HandshakeRefused(_)));

    // Nothing beyond the handshake reached the wire
    let seen = relay.seen_protocols.lock().clone();
    assert!(!seen.is_empty());
    assert!(seen.iter().all(|&mpid| mpid == 0));
}

#[tokio::test]
async fn test_query_reply_fails_negotiation() {
    let relay = ScriptedRelay::spawn(RelayScript {
        handshake: HandshakeReply::QueryReply,
        tip_reply: None,
        peers_reply: None,
        peers_reply_raw: None,
        peers_delay: None,
    })
    .await;

    let err = probe(&relay.endpoint(), &fast_options()).await.unwrap_err();
    assert!(matches!(err, NetworkError::HandshakeUnexpected(_)));
}

#[tokio::test]
async fn test_peer_sharing_populated() {
    let peers = Value::Array(vec![
        Value::from(1u64),
        Value::Array(vec![
            Value::Array(vec![
                Value::from(0u64),
                Value::from(0x0102_030Au64),
                Value::from(3001u64),
            ]),
            Value::Array(vec![
                Value::from(1u64),
                Value::from(0x2001_0DB8u64),
                Value::from(0u64),
                Value::from(0u64),
                Value::from(1u64),
                Value::from(3001u64),
            ]),
        ]),
    ]);
    let relay = ScriptedRelay::spawn(RelayScript {
        peers_reply: Some(peers),
        ..RelayScript::accepting(15, true, intersect_not_found(tip_value(100, [0xAB; 32], 42)))
    })
    .await;

    let report = probe(&relay.endpoint(), &fast_options()).await.unwrap();

    assert_eq!(report.negotiated_version, 15);
    assert_eq!(report.peers_discovered.len(), 2);
    assert_eq!(report.peers_discovered[0].ip, "1.2.3.10");
    assert_eq!(report.peers_discovered[0].port, 3001);
    assert!(report.peers_discovered[1].ip.ends_with("0000:0001"));
    assert_eq!(report.peers_discovered[1].port, 3001);
}

#[tokio::test]
async fn test_tip_before_peers_still_succeeds() {
    let peers = Value::Array(vec![
        Value::from(1u64),
        Value::Array(vec![Value::Array(vec![
            Value::from(0u64),
            Value::from(0x7F00_0001u64),
            Value::from(3001u64),
        ])]),
    ]);
    let relay = ScriptedRelay::spawn(RelayScript {
        peers_reply: Some(peers),
        peers_delay: Some(Duration::from_secs(2)),
        ..RelayScript::accepting(15, true, intersect_not_found(tip_value(100, [0u8; 32], 42)))
    })
    .await;

    let report = probe(&relay.endpoint(), &fast_options()).await.unwrap();

    assert_eq!(report.negotiated_version, 15);
    assert!(report.peers_discovered.is_empty());
}

#[tokio::test]
async fn test_garbage_peer_sharing_payload_is_not_fatal() {
    // The share reply arrives as bytes that are not CBOR at all; only the
    // peer-sharing mini-protocol dies, the tip still comes through
    let relay = ScriptedRelay::spawn(RelayScript {
        peers_reply_raw: Some(vec![0xFF, 0x00, 0x9F]),
        ..RelayScript::accepting(15, true, intersect_not_found(tip_value(100, [0u8; 32], 42)))
    })
    .await;

    let report = probe(&relay.endpoint(), &fast_options()).await.unwrap();

    assert_eq!(report.negotiated_version, 15);
    assert_eq!(
        report.tip,
        Tip::Header {
            slot: 100,
            hash_hex: "0".repeat(64),
            block_no: 42,
        }
    );
    assert!(report.peers_discovered.is_empty());
}

#[tokio::test]
async fn test_no_share_request_when_sharing_disabled() {
    let relay = ScriptedRelay::spawn(RelayScript::accepting(
        15,
        true,
        intersect_not_found(tip_value(100, [0u8; 32], 42)),
    ))
    .await;

    let options = ProbeOptions {
        want_peer_sharing: false,
        ..fast_options()
    };
    let report = probe(&relay.endpoint(), &options).await.unwrap();

    assert!(report.peers_discovered.is_empty());
    assert!(!relay.seen_protocols.lock().contains(&10));
}

#[tokio::test]
async fn test_silent_peer_hits_session_timeout() {
    // Accept the handshake, then never answer the intersect
    let relay = ScriptedRelay::spawn(RelayScript {
        handshake: HandshakeReply::Accept {
            version: 14,
            data: version_data_value(ouro_network::MAINNET_MAGIC, false),
        },
        tip_reply: None,
        peers_reply: None,
        peers_reply_raw: None,
        peers_delay: None,
    })
    .await;

    let options = ProbeOptions {
        connection: ConnectionConfig {
            connect_timeout: Duration::from_secs(2),
            session_timeout: Duration::from_millis(700),
            protocol_timeout: Duration::from_secs(3),
        },
        ..ProbeOptions::default()
    };

    let err = probe(&relay.endpoint(), &options).await.unwrap_err();
    assert!(matches!(
        err,
        NetworkError::Timeout(TimeoutScope::Session)
    ));
}

#[tokio::test]
async fn test_oversize_message_leaves_connection_usable() {
    let relay = ScriptedRelay::spawn(RelayScript::accepting(
        14,
        false,
        intersect_not_found(tip_value(7, [0x11; 32], 3)),
    ))
    .await;

    let options = fast_options();
    let connection = Connection::connect(&relay.endpoint(), &options.connection)
        .await
        .unwrap();
    let demux = Demux::start(connection);

    let mut hs_client = demux.register(handshake::PROTOCOL_ID, options.connection.protocol_timeout);
    handshake::negotiate(&mut hs_client, options.network_magic, false)
        .await
        .unwrap();
    demux.unregister(handshake::PROTOCOL_ID);

    let mut cs_client = demux.register(chainsync::PROTOCOL_ID, options.connection.protocol_timeout);

    // A payload over the 16-bit length limit fails before any bytes move
    let oversize = Value::Bytes(vec![0u8; 70_000]);
    let err = cs_client.send(&oversize).await.unwrap_err();
    assert!(matches!(
        err,
        NetworkError::Wire(ouro_wire::WireError::PayloadTooLarge { .. })
    ));

    // The same client still completes a real exchange
    let tip = chainsync::query_tip(&mut cs_client).await.unwrap();
    assert_eq!(
        tip,
        Tip::Header {
            slot: 7,
            hash_hex: "11".repeat(32),
            block_no: 3,
        }
    );

    demux.shutdown();
}
