//! Connect protocol -- dedup, retry bound, resolution, closed writes.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use courier_node::NodeError;

use crate::harness::{closed_port, wait_until, Ping, TestNodeBuilder, TIMEOUT};

/// Allowance on top of `attempts × retry_delay`. Refused loopback connects
/// return immediately, so the sleeps dominate.
const SLACK: Duration = Duration::from_secs(3);

#[test]
fn test_connect_dedups_live_endpoint() {
    let server = TestNodeBuilder::new().spawn();
    let client = TestNodeBuilder::new().spawn();

    let first = client.connect_to(&server);
    let second = client.node.connect("127.0.0.1", server.port()).unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let by_name = client.node.connect("localhost", server.port()).unwrap();
    assert!(Arc::ptr_eq(&first, &by_name));

    assert_eq!(client.node.peer_count(), 1);
    assert!(server.wait_peers(1));
    assert_eq!(server.node.stats().connections_opened, 1);
}

#[test]
fn test_connect_after_close_opens_fresh_connection() {
    let server = TestNodeBuilder::new().spawn();
    let client = TestNodeBuilder::new().spawn();

    let first = client.connect_to(&server);
    first.close();
    let second = client.node.connect("127.0.0.1", server.port()).unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert!(!second.is_closed());
    assert_eq!(client.node.peer_count(), 1);
    assert!(client
        .node
        .connections()
        .iter()
        .all(|c| Arc::ptr_eq(c, &second)));

    second.write(&Ping { seq: 3 });
    assert!(wait_until(TIMEOUT, || server.journal.len() == 1));
    assert_eq!(server.journal.entries(), vec!["ping 3"]);
}

#[test]
fn test_retry_bound_with_small_policy() {
    let client = TestNodeBuilder::new().connect_policy(5, 20).spawn();
    let port = closed_port();

    let started = Instant::now();
    let err = client.node.connect("127.0.0.1", port).unwrap_err();
    let elapsed = started.elapsed();

    match err {
        NodeError::ConnectFailure { attempts, port: p, .. } => {
            assert_eq!(attempts, 5);
            assert_eq!(p, port);
        }
        other => panic!("expected ConnectFailure, got {other:?}"),
    }
    assert!(elapsed >= Duration::from_millis(100), "gave up after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(100) + SLACK, "gave up after {elapsed:?}");
    assert_eq!(client.node.peer_count(), 0);
}

#[test]
fn test_retry_bound_with_default_policy() {
    let client = TestNodeBuilder::new()
        .config(|c| c.connect = Default::default())
        .spawn();
    let port = closed_port();

    let started = Instant::now();
    let err = client.node.connect("127.0.0.1", port).unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, NodeError::ConnectFailure { attempts: 64, .. }));
    assert!(elapsed >= Duration::from_millis(6400), "gave up after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(6400) + SLACK, "gave up after {elapsed:?}");
}

#[test]
fn test_retry_succeeds_once_listener_appears() {
    let port = closed_port();
    let late = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(150));
        let listener = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
        let (socket, _) = listener.accept().unwrap();
        socket
    });

    let client = TestNodeBuilder::new().connect_policy(50, 20).spawn();
    let conn = client.node.connect("127.0.0.1", port).unwrap();
    assert_eq!(conn.remote().port(), port);
    assert_eq!(client.node.peer_count(), 1);

    let _socket = late.join().unwrap();
}

#[test]
fn test_resolution_failure() {
    let client = TestNodeBuilder::new().spawn();
    let err = client.node.connect("no-such-host.invalid", 9000).unwrap_err();
    assert!(matches!(err, NodeError::Resolution { .. }), "{err:?}");
    assert_eq!(client.node.peer_count(), 0);
}

#[test]
fn test_write_after_close_completes_with_error() {
    let server = TestNodeBuilder::new().spawn();
    let client = TestNodeBuilder::new().spawn();
    let conn = client.connect_to(&server);

    conn.close();
    assert!(conn.is_closed());

    let (tx, rx) = mpsc::channel();
    conn.write_with(&Ping { seq: 1 }, move |result| {
        tx.send(result).unwrap();
    });
    let result = rx.recv_timeout(TIMEOUT).unwrap();
    assert!(
        matches!(result, Err(NodeError::ConnectionClosed(addr)) if addr == conn.remote()),
        "{result:?}"
    );
    assert!(client.wait_peers(0));
}
