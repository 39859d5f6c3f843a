//! Peer barrier -- the entry action runs exactly once, after `wait_for` peers.

use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::harness::{wait_until, TestNodeBuilder, TIMEOUT};

#[test]
fn test_entry_waits_for_nth_peer() {
    let runs = Arc::new(AtomicUsize::new(0));
    let peers_at_entry = Arc::new(Mutex::new(None));

    let server = {
        let runs = runs.clone();
        let peers_at_entry = peers_at_entry.clone();
        TestNodeBuilder::new()
            .wait_for(3)
            .entry(move |node| {
                runs.fetch_add(1, Ordering::SeqCst);
                *peers_at_entry.lock().unwrap() = Some(node.peer_count());
            })
            .spawn()
    };

    let mut sockets = Vec::new();
    for joined in 1..=2 {
        sockets.push(TcpStream::connect(server.addr).unwrap());
        assert!(server.wait_peers(joined));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(runs.load(Ordering::SeqCst), 0, "entry ran with {joined} peers");
    }

    sockets.push(TcpStream::connect(server.addr).unwrap());
    assert!(wait_until(TIMEOUT, || runs.load(Ordering::SeqCst) == 1));
    assert_eq!(*peers_at_entry.lock().unwrap(), Some(3));

    // Later peers do not re-trigger it.
    sockets.push(TcpStream::connect(server.addr).unwrap());
    assert!(server.wait_peers(4));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_outbound_connect_counts_toward_barrier() {
    let server = TestNodeBuilder::new().spawn();

    let runs = Arc::new(AtomicUsize::new(0));
    let client = {
        let runs = runs.clone();
        TestNodeBuilder::new()
            .wait_for(1)
            .entry(move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
            })
            .spawn()
    };

    client.connect_to(&server);
    assert!(wait_until(TIMEOUT, || runs.load(Ordering::SeqCst) == 1));
}

#[test]
fn test_no_entry_without_enough_peers() {
    let runs = Arc::new(AtomicUsize::new(0));
    let server = {
        let runs = runs.clone();
        TestNodeBuilder::new()
            .wait_for(2)
            .entry(move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
            })
            .spawn()
    };

    // One peer joins and leaves: the table shrinks back, the barrier never held.
    let socket = TcpStream::connect(server.addr).unwrap();
    assert!(server.wait_peers(1));
    drop(socket);
    assert!(server.wait_peers(0));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}
