//! Connection table -- thread-safe registry of live peer connections.
//!
//! Maps remote endpoint → `Arc<Connection>`. Written on registration
//! (accept or connect) and on teardown; read by actions on the dispatch
//! thread and by `connect` on caller threads.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::connection::Connection;

#[derive(Clone, Default)]
pub struct ConnectionTable {
    inner: Arc<RwLock<HashMap<SocketAddr, Arc<Connection>>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly identified connection. Returns the number of live
    /// connections, or the live connection already registered under the same
    /// endpoint. A closed entry whose reader has not yet deregistered it is
    /// overwritten.
    pub fn insert(&self, conn: Arc<Connection>) -> Result<usize, Arc<Connection>> {
        let remote = conn.remote();
        let (size, stale) = {
            let mut table = self.inner.write();
            if let Some(existing) = table.get(&remote) {
                if !existing.is_closed() {
                    return Err(existing.clone());
                }
            }
            let stale = table.insert(remote, conn.clone());
            (live_count(&table), stale)
        };
        if let Some(stale) = stale {
            tracing::debug!(%remote, conn_id = stale.id(), "table: closed entry overwritten");
        }
        tracing::info!(
            %remote,
            conn_id = conn.id(),
            direction = conn.direction().name(),
            table_size = size,
            "table: connection added"
        );
        Ok(size)
    }

    /// Insert `conn` unconditionally, returning the live count and whatever
    /// it displaced. The caller closes the displaced connection.
    pub fn replace(&self, conn: Arc<Connection>) -> (usize, Option<Arc<Connection>>) {
        let remote = conn.remote();
        let (size, displaced) = {
            let mut table = self.inner.write();
            let displaced = table.insert(remote, conn.clone());
            (live_count(&table), displaced)
        };
        tracing::info!(
            %remote,
            conn_id = conn.id(),
            displaced = displaced.as_ref().map(|c| c.id()),
            table_size = size,
            "table: connection replaced"
        );
        (size, displaced)
    }

    /// Remove the entry for `conn`'s endpoint, but only if it still refers to
    /// `conn` and not to a newer connection to the same endpoint.
    pub fn remove_if_current(&self, conn: &Connection) -> bool {
        let remote = conn.remote();
        let mut table = self.inner.write();
        let current = table.get(&remote).is_some_and(|c| c.id() == conn.id());
        if current {
            table.remove(&remote);
            tracing::info!(
                %remote,
                conn_id = conn.id(),
                table_size = table.len(),
                "table: connection removed"
            );
        } else {
            tracing::debug!(
                %remote,
                conn_id = conn.id(),
                "table: connection closed, table has newer entry"
            );
        }
        current
    }

    pub fn get(&self, remote: &SocketAddr) -> Option<Arc<Connection>> {
        self.inner
            .read()
            .get(remote)
            .filter(|c| !c.is_closed())
            .cloned()
    }

    /// First live connection whose endpoint is among `candidates`, in
    /// candidate order.
    pub fn find_any(&self, candidates: &[SocketAddr]) -> Option<Arc<Connection>> {
        let table = self.inner.read();
        candidates
            .iter()
            .filter_map(|addr| table.get(addr))
            .find(|c| !c.is_closed())
            .cloned()
    }

    /// All live connections, ordered by remote endpoint.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let mut conns: Vec<_> = self
            .inner
            .read()
            .values()
            .filter(|c| !c.is_closed())
            .cloned()
            .collect();
        conns.sort_by_key(|c| c.remote());
        conns
    }

    /// Number of live connections. Closed entries awaiting removal by their
    /// reader are not counted.
    pub fn len(&self) -> usize {
        live_count(&self.inner.read())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty the table, handing back whatever was registered.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        self.inner.write().drain().map(|(_, c)| c).collect()
    }
}

fn live_count(table: &HashMap<SocketAddr, Arc<Connection>>) -> usize {
    table.values().filter(|c| !c.is_closed()).count()
}
