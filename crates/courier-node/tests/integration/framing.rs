//! Framing robustness -- protocol violations close only the offending
//! connection; undecodable parcels are dropped without closing anything.

use courier_protocol::encode_payload;

use crate::harness::{wait_until, Ping, RawPeer, TestNodeBuilder, TIMEOUT};

#[test]
fn test_truncated_frame_closes_only_that_connection() {
    let server = TestNodeBuilder::new().spawn();
    let mut bad = RawPeer::connect(server.addr);
    let mut good = RawPeer::connect(server.addr);
    assert!(server.wait_peers(2));

    // Announce 100 bytes, deliver 10, then EOF.
    let mut partial = 100u64.to_le_bytes().to_vec();
    partial.extend_from_slice(&[0xAB; 10]);
    bad.send_raw(&partial);
    bad.finish();

    assert!(wait_until(TIMEOUT, || server.node.stats().protocol_violations == 1));
    assert!(server.wait_peers(1));

    good.send_action(&Ping { seq: 7 });
    assert!(wait_until(TIMEOUT, || server.journal.len() == 1));
    assert_eq!(server.journal.entries(), vec!["ping 7"]);
    assert_eq!(server.node.stats().protocol_violations, 1);
}

#[test]
fn test_truncated_header_is_a_violation() {
    let server = TestNodeBuilder::new().spawn();
    let mut peer = RawPeer::connect(server.addr);
    assert!(server.wait_peers(1));

    peer.send_raw(&[1, 0, 0]);
    peer.finish();

    assert!(wait_until(TIMEOUT, || server.node.stats().protocol_violations == 1));
    assert!(server.wait_peers(0));
}

#[test]
fn test_oversize_frame_is_a_violation() {
    let server = TestNodeBuilder::new().max_frame_bytes(1024).spawn();
    let mut peer = RawPeer::connect(server.addr);
    assert!(server.wait_peers(1));

    peer.send_raw(&(1u64 << 40).to_le_bytes());

    assert!(wait_until(TIMEOUT, || server.node.stats().protocol_violations == 1));
    assert!(server.wait_peers(0));
}

#[test]
fn test_unknown_tag_is_recoverable() {
    let server = TestNodeBuilder::new().spawn();
    let mut peer = RawPeer::connect(server.addr);
    assert!(server.wait_peers(1));

    peer.send_frame(&encode_payload("no_such_action", b"{}").unwrap());
    peer.send_action(&Ping { seq: 1 });

    assert!(wait_until(TIMEOUT, || server.node.stats().parcels_dispatched == 1));
    assert_eq!(server.journal.entries(), vec!["ping 1"]);
    let stats = server.node.stats();
    assert_eq!(stats.decode_failures, 1);
    assert_eq!(stats.protocol_violations, 0);
    assert_eq!(server.node.peer_count(), 1);
}

#[test]
fn test_zero_length_frame_is_recoverable() {
    let server = TestNodeBuilder::new().spawn();
    let mut peer = RawPeer::connect(server.addr);
    assert!(server.wait_peers(1));

    peer.send_frame(&[]);
    peer.send_action(&Ping { seq: 2 });

    assert!(wait_until(TIMEOUT, || server.journal.len() == 1));
    let stats = server.node.stats();
    assert_eq!(stats.frames_received, 2);
    assert_eq!(stats.decode_failures, 1);
    assert_eq!(stats.protocol_violations, 0);
    assert_eq!(server.node.peer_count(), 1);
}

#[test]
fn test_clean_eof_deregisters_without_violation() {
    let server = TestNodeBuilder::new().spawn();
    let mut peer = RawPeer::connect(server.addr);
    assert!(server.wait_peers(1));

    peer.send_action(&Ping { seq: 3 });
    peer.finish();

    assert!(server.wait_peers(0));
    assert!(wait_until(TIMEOUT, || server.journal.len() == 1));
    let stats = server.node.stats();
    assert_eq!(stats.protocol_violations, 0);
    assert_eq!(stats.connections_closed, 1);
}

#[test]
fn test_frames_split_across_writes() {
    let server = TestNodeBuilder::new().spawn();
    let mut peer = RawPeer::connect(server.addr);
    assert!(server.wait_peers(1));

    let mut frames = Vec::new();
    for seq in 0..3u64 {
        let payload = courier_protocol::encode_action(&Ping { seq } as &courier_node::NodeAction)
            .unwrap();
        frames.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        frames.extend_from_slice(&payload);
    }
    for chunk in frames.chunks(5) {
        peer.send_raw(chunk);
        std::thread::sleep(std::time::Duration::from_millis(1));
    }

    assert!(wait_until(TIMEOUT, || server.journal.len() == 3));
    assert_eq!(server.journal.entries(), vec!["ping 0", "ping 1", "ping 2"]);
}

#[test]
fn test_peer_reset_counts_socket_error_and_deregisters() {
    let server = TestNodeBuilder::new().spawn();
    let peer = RawPeer::connect(server.addr);
    assert!(server.wait_peers(1));

    // Closing with unread data in the receive buffer makes the peer's kernel
    // answer with RST instead of FIN.
    let conn = server.handle().connection(&peer.local_addr()).unwrap();
    conn.write(&Ping { seq: 1 });
    assert!(wait_until(TIMEOUT, || server.node.stats().frames_written == 1));
    std::thread::sleep(std::time::Duration::from_millis(50));
    drop(peer);

    assert!(wait_until(TIMEOUT, || server.node.stats().socket_errors == 1));
    assert!(server.wait_peers(0));
    assert!(conn.is_closed());
    let stats = server.node.stats();
    assert_eq!(stats.protocol_violations, 0);
    assert_eq!(stats.connections_closed, 1);
}
