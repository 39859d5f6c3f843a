//! End to end -- a server waits for two clients, then greets each once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::harness::{wait_until, Ping, TestMesh, TestNodeBuilder, TIMEOUT};

#[test]
fn test_broadcast_to_two_clients() {
    let zero_hits = Arc::new(AtomicUsize::new(0));
    let failures = Arc::new(AtomicUsize::new(0));

    let server = {
        let zero_hits = zero_hits.clone();
        let failures = failures.clone();
        TestNodeBuilder::new().wait_for(2).entry(move |node| {
            let conns = node.connections();
            let remaining = Arc::new(AtomicUsize::new(conns.len()));
            for (seq, conn) in conns.into_iter().enumerate() {
                let remaining = remaining.clone();
                let zero_hits = zero_hits.clone();
                let failures = failures.clone();
                let node = node.clone();
                conn.write_with(&Ping { seq: seq as u64 }, move |result| {
                    if result.is_err() {
                        failures.fetch_add(1, Ordering::SeqCst);
                    }
                    if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                        zero_hits.fetch_add(1, Ordering::SeqCst);
                        node.stop();
                    }
                });
            }
        })
    };

    let mesh = TestMesh::new(server, 2);

    for client in &mesh.clients {
        assert!(wait_until(TIMEOUT, || client.journal.len() == 1));
    }
    assert!(wait_until(TIMEOUT, || mesh.server.handle().is_stopped()));

    // Nothing further arrives.
    std::thread::sleep(Duration::from_millis(200));
    let mut seqs: Vec<String> = mesh
        .clients
        .iter()
        .flat_map(|c| c.journal.entries())
        .collect();
    seqs.sort();
    assert_eq!(seqs, vec!["ping 0", "ping 1"]);

    assert_eq!(zero_hits.load(Ordering::SeqCst), 1);
    assert_eq!(failures.load(Ordering::SeqCst), 0);
    assert_eq!(mesh.server.node.stats().frames_written, 2);
    for client in &mesh.clients {
        assert!(wait_until(TIMEOUT, || client.node.stats().parcels_dispatched == 1));
    }
}
