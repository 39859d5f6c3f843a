//! Dispatch queues -- local tasks and inbound parcels.
//!
//! Both are unbounded crossbeam channels: any number of producers (IO tasks,
//! caller threads, actions), one consumer (the dispatch loop). Channels grow
//! block by block, so a push never fails while the node is alive.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Select, Sender};

/// One encoded action as read off a connection, length prefix stripped.
#[derive(Debug, Clone)]
pub struct Parcel {
    pub from: SocketAddr,
    pub payload: Bytes,
}

/// Next unit of work for the dispatch loop.
#[derive(Debug)]
pub enum Work<T, P> {
    Local(T),
    Parcel(P),
}

pub struct DispatchQueues<T, P> {
    local_tx: Sender<T>,
    local_rx: Receiver<T>,
    parcel_tx: Sender<P>,
    parcel_rx: Receiver<P>,
}

impl<T, P> DispatchQueues<T, P> {
    pub fn new() -> Self {
        let (local_tx, local_rx) = channel::unbounded();
        let (parcel_tx, parcel_rx) = channel::unbounded();
        Self {
            local_tx,
            local_rx,
            parcel_tx,
            parcel_rx,
        }
    }

    pub fn local_sender(&self) -> Sender<T> {
        self.local_tx.clone()
    }

    pub fn parcel_sender(&self) -> Sender<P> {
        self.parcel_tx.clone()
    }

    pub fn push_local(&self, task: T) {
        // Both ends live in `self`, so the channel cannot be disconnected.
        let _ = self.local_tx.send(task);
    }

    pub fn push_parcel(&self, parcel: P) {
        let _ = self.parcel_tx.send(parcel);
    }

    pub fn local_len(&self) -> usize {
        self.local_rx.len()
    }

    pub fn parcel_len(&self) -> usize {
        self.parcel_rx.len()
    }

    /// Drop everything queued in both channels. Returns how many items were
    /// discarded.
    pub fn clear(&self) -> usize {
        self.local_rx.try_iter().count() + self.parcel_rx.try_iter().count()
    }

    /// Pop the next unit of work, local tasks first.
    ///
    /// When both queues are empty, blocks until either becomes ready or
    /// `idle` elapses, then returns `None` so the caller can re-check its
    /// stop flag. The ready item is not consumed by the wait: it is popped on
    /// the next call, which keeps the local-first ordering.
    pub fn next(&self, idle: Duration) -> Option<Work<T, P>> {
        if let Ok(task) = self.local_rx.try_recv() {
            return Some(Work::Local(task));
        }
        if let Ok(parcel) = self.parcel_rx.try_recv() {
            return Some(Work::Parcel(parcel));
        }

        let mut sel = Select::new();
        sel.recv(&self.local_rx);
        sel.recv(&self.parcel_rx);
        let _ = sel.ready_timeout(idle);
        None
    }
}

impl<T, P> Default for DispatchQueues<T, P> {
    fn default() -> Self {
        Self::new()
    }
}
