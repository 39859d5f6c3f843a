//! Runtime counters, shared between the IO tasks, the dispatch loop and
//! whoever wants to observe the node.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug)]
pub struct NodeStats {
    /// Connections registered in the table (accepted or dialled).
    pub connections_opened: AtomicU64,
    /// Connections whose read loop ended.
    pub connections_closed: AtomicU64,
    /// Complete frames read off the wire.
    pub frames_received: AtomicU64,
    /// Parcels decoded and invoked by the dispatch loop.
    pub parcels_dispatched: AtomicU64,
    /// Local tasks run by the dispatch loop (writes, entry action, user tasks).
    pub local_tasks_run: AtomicU64,
    /// Parcels dropped because they could not be decoded.
    pub decode_failures: AtomicU64,
    /// Connections closed for breaking the framing contract.
    pub protocol_violations: AtomicU64,
    /// Read or write completions that carried a transport error.
    pub socket_errors: AtomicU64,
    /// Frames confirmed written by the OS.
    pub frames_written: AtomicU64,
    /// Bytes confirmed written, length prefixes included.
    pub bytes_written: AtomicU64,
}

/// Point-in-time copy of [`NodeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub frames_received: u64,
    pub parcels_dispatched: u64,
    pub local_tasks_run: u64,
    pub decode_failures: u64,
    pub protocol_violations: u64,
    pub socket_errors: u64,
    pub frames_written: u64,
    pub bytes_written: u64,
}

impl NodeStats {
    pub fn new() -> Self {
        Self {
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            parcels_dispatched: AtomicU64::new(0),
            local_tasks_run: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            protocol_violations: AtomicU64::new(0),
            socket_errors: AtomicU64::new(0),
            frames_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            parcels_dispatched: self.parcels_dispatched.load(Ordering::Relaxed),
            local_tasks_run: self.local_tasks_run.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            socket_errors: self.socket_errors.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

impl Default for NodeStats {
    fn default() -> Self {
        Self::new()
    }
}
