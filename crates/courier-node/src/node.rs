//! Node runtime -- IO reactor, dispatch thread, accept/connect, peer barrier.
//!
//! A node owns:
//!   - a single-threaded tokio runtime (accept loop + per-connection IO tasks),
//!     driven by whichever thread calls [`Node::run`]
//!   - one dedicated dispatch thread that runs local tasks and decoded parcels
//!   - the connection table and the two dispatch queues
//!
//! Actions run on the dispatch thread and reach the node through the
//! [`NodeHandle`] they are invoked with.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{SocketAddr, TcpStream as StdTcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use courier_protocol::{encode_action, Action, ActionRegistry};
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::watch;

use crate::config::NodeConfig;
use crate::connection::{Connection, Direction};
use crate::error::{NodeError, Result};
use crate::queue::{DispatchQueues, Parcel, Work};
use crate::stats::{NodeStats, StatsSnapshot};
use crate::table::ConnectionTable;

/// An action as seen by this runtime.
pub type NodeAction = dyn Action<NodeHandle>;

/// Registry of the actions a node can decode.
pub type Registry = ActionRegistry<NodeHandle>;

/// Work queued onto the dispatch thread.
pub type LocalTask = Box<dyn FnOnce(&NodeHandle) + Send>;

/// Runs once, on the dispatch thread, after `wait_for` peers registered.
pub type EntryPoint = LocalTask;

const LISTEN_BACKLOG: u32 = 1024;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

struct Shared {
    config: NodeConfig,
    registry: Arc<Registry>,
    table: ConnectionTable,
    queues: DispatchQueues<LocalTask, Parcel>,
    stats: Arc<NodeStats>,
    started: AtomicBool,
    stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
    entry: Mutex<Option<EntryPoint>>,
    io: Handle,
    local_addr: OnceLock<SocketAddr>,
    next_conn_id: AtomicU64,
    extensions: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

/// Cheap, cloneable access to a node, handed to every action.
#[derive(Clone)]
pub struct NodeHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("local_addr", &self.local_addr())
            .field("peers", &self.peer_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl NodeHandle {
    /// Request shutdown. Idempotent; safe from any thread, actions included.
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("node stopping");
        self.shared.shutdown.send_replace(true);
        // Wake the dispatch loop if it is parked on empty queues.
        self.shared.queues.push_local(Box::new(|_: &NodeHandle| {}));
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Live connections, ordered by remote endpoint.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared.table.connections()
    }

    pub fn connection(&self, remote: &SocketAddr) -> Option<Arc<Connection>> {
        self.shared.table.get(remote)
    }

    pub fn peer_count(&self) -> usize {
        self.shared.table.len()
    }

    /// Queue `task` for the dispatch thread. Local tasks run ahead of any
    /// pending parcels.
    pub fn spawn_local<F>(&self, task: F)
    where
        F: FnOnce(&NodeHandle) + Send + 'static,
    {
        self.shared.queues.push_local(Box::new(task));
    }

    /// Encode `action` and queue it as if it had arrived from a peer.
    pub fn post(&self, action: &NodeAction) -> Result<()> {
        let payload = encode_action(action)?;
        let from = self
            .local_addr()
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        self.shared.queues.push_parcel(Parcel { from, payload });
        Ok(())
    }

    /// Connect to `host:port`, or return the live connection to it.
    ///
    /// Blocks the calling thread through resolution and the retry schedule
    /// from `[connect]`; `stop()` does not cut it short. A successful
    /// connect counts toward the peer barrier like an accepted one.
    pub fn connect(&self, host: &str, port: u16) -> Result<Arc<Connection>> {
        let candidates = resolve(host, port)?;
        if let Some(existing) = self.shared.table.find_any(&candidates) {
            tracing::debug!(remote = %existing.remote(), "connect: reusing live connection");
            return Ok(existing);
        }

        let policy = self.shared.config.connect_policy();
        let mut last_err = None;
        for attempt in 1..=policy.attempts {
            match StdTcpStream::connect(&candidates[..]) {
                Ok(stream) => {
                    tracing::debug!(host, port, attempt, "connect: established");
                    return self.shared.register_std(stream, Direction::Outbound);
                }
                Err(e) => {
                    tracing::debug!(host, port, attempt, "connect attempt failed: {e}");
                    last_err = Some(e);
                    std::thread::sleep(policy.retry_delay);
                }
            }
        }

        let source = last_err.unwrap_or_else(|| io::Error::other("no connect attempts made"));
        tracing::warn!(host, port, attempts = policy.attempts, "connect failed: {source}");
        Err(NodeError::ConnectFailure {
            host: host.to_string(),
            port,
            attempts: policy.attempts,
            source,
        })
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Bound listen address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr.get().copied()
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub fn config(&self) -> &NodeConfig {
        &self.shared.config
    }

    /// Application state registered with [`Node::insert_extension`].
    pub fn extension<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let ext = self.shared.extensions.read().get(&TypeId::of::<T>()).cloned()?;
        ext.downcast::<T>().ok()
    }
}

/// Resolve `host:port`, IPv4 candidates first, duplicates removed.
fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let resolution = |source: io::Error| NodeError::Resolution {
        host: host.to_string(),
        port,
        source,
    };
    let mut addrs: Vec<SocketAddr> = (host, port).to_socket_addrs().map_err(resolution)?.collect();
    addrs.sort_by_key(|a| a.is_ipv6());
    let mut seen = HashSet::new();
    addrs.retain(|a| seen.insert(*a));
    if addrs.is_empty() {
        return Err(resolution(io::Error::new(
            io::ErrorKind::NotFound,
            "no addresses",
        )));
    }
    Ok(addrs)
}

impl Shared {
    fn register_std(&self, stream: StdTcpStream, direction: Direction) -> Result<Arc<Connection>> {
        stream.set_nonblocking(true)?;
        let stream = {
            let _guard = self.io.enter();
            TcpStream::from_std(stream)?
        };
        self.register(stream, direction)
    }

    /// Identify the peer, insert into the table, start IO, check the barrier.
    fn register(&self, stream: TcpStream, direction: Direction) -> Result<Arc<Connection>> {
        let remote = stream.peer_addr()?;
        let local = stream.local_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%remote, "set_nodelay failed: {e}");
        }

        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (conn, outbound_rx) = Connection::new(
            id,
            remote,
            local,
            direction,
            self.queues.local_sender(),
            self.stats.clone(),
            self.config.dispatch.max_frame_bytes,
        );

        let size = match self.table.insert(conn.clone()) {
            Ok(size) => size,
            Err(existing) if direction == Direction::Outbound => {
                // Two connects raced to the same endpoint; keep the first.
                tracing::warn!(
                    %remote,
                    conn_id = existing.id(),
                    "duplicate outbound registration rejected, keeping existing connection"
                );
                return Ok(existing);
            }
            Err(_) => {
                // The OS hands out an inbound 4-tuple again only once the old
                // socket is gone, so the table entry is stale.
                let (size, displaced) = self.table.replace(conn.clone());
                if let Some(stale) = displaced {
                    tracing::warn!(
                        %remote,
                        conn_id = stale.id(),
                        "inbound endpoint reused, closing stale connection"
                    );
                    stale.close();
                }
                size
            }
        };

        NodeStats::incr(&self.stats.connections_opened);
        conn.spawn_io(
            stream,
            outbound_rx,
            self.table.clone(),
            self.queues.parcel_sender(),
            &self.io,
        );
        self.check_barrier(size);
        Ok(conn)
    }

    fn check_barrier(&self, peers: usize) {
        if peers < self.config.node.wait_for {
            return;
        }
        if let Some(entry) = self.entry.lock().take() {
            tracing::info!(
                peers,
                wait_for = self.config.node.wait_for,
                "peer barrier reached, scheduling entry action"
            );
            self.queues.push_local(entry);
        }
    }

    fn dispatch_parcel(&self, handle: &NodeHandle, parcel: Parcel) {
        match self.registry.decode(&parcel.payload) {
            Ok(action) => {
                tracing::debug!(remote = %parcel.from, tag = action.tag(), "dispatching parcel");
                action.invoke(handle);
                NodeStats::incr(&self.stats.parcels_dispatched);
            }
            Err(e) => {
                NodeStats::incr(&self.stats.decode_failures);
                tracing::warn!(remote = %parcel.from, "dropping parcel: {e}");
            }
        }
    }
}

fn dispatch_loop(handle: NodeHandle) {
    let shared = handle.shared.clone();
    let idle = shared.config.idle_wait();
    tracing::debug!("dispatch loop started");

    while !shared.stopped.load(Ordering::Acquire) {
        match shared.queues.next(idle) {
            Some(Work::Local(task)) => {
                task(&handle);
                NodeStats::incr(&shared.stats.local_tasks_run);
            }
            Some(Work::Parcel(parcel)) => shared.dispatch_parcel(&handle, parcel),
            None => {}
        }
    }

    tracing::debug!("dispatch loop stopped");
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    tracing::info!(%remote, "accepted inbound connection");
                    if let Err(e) = shared.register(stream, Direction::Inbound) {
                        tracing::warn!(%remote, "failed to register inbound connection: {e}");
                    }
                }
                Err(e) => {
                    NodeStats::incr(&shared.stats.socket_errors);
                    tracing::warn!("failed to accept connection: {e}");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
            _ = shutdown.changed() => {}
        }
    }
    tracing::info!("shutdown signal, stopping accept loop");
}

/// An active-messaging node.
///
/// Lifecycle: `new` → optional `connect`s → `start` → `run` (blocks until
/// `stop`). Dropping the node stops it, joins the dispatch thread and closes
/// every connection.
pub struct Node {
    handle: NodeHandle,
    exec_thread: Mutex<Option<JoinHandle<()>>>,
    io: Runtime,
}

impl Node {
    pub fn new(config: NodeConfig, registry: Registry) -> Result<Self> {
        Self::build(config, registry, None)
    }

    /// Like [`Node::new`], with an entry action that runs once `wait_for`
    /// peers have registered.
    pub fn with_entry<F>(config: NodeConfig, registry: Registry, entry: F) -> Result<Self>
    where
        F: FnOnce(&NodeHandle) + Send + 'static,
    {
        Self::build(config, registry, Some(Box::new(entry)))
    }

    fn build(config: NodeConfig, registry: Registry, entry: Option<EntryPoint>) -> Result<Self> {
        config.validate()?;
        let io = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (shutdown, _) = watch::channel(false);

        tracing::debug!(
            actions = registry.len(),
            wait_for = config.node.wait_for,
            "node created"
        );
        let shared = Arc::new(Shared {
            config,
            registry: Arc::new(registry),
            table: ConnectionTable::new(),
            queues: DispatchQueues::new(),
            stats: Arc::new(NodeStats::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown,
            entry: Mutex::new(entry),
            io: io.handle().clone(),
            local_addr: OnceLock::new(),
            next_conn_id: AtomicU64::new(1),
            extensions: RwLock::new(HashMap::new()),
        });

        Ok(Self {
            handle: NodeHandle { shared },
            exec_thread: Mutex::new(None),
            io,
        })
    }

    /// Make `value` reachable from actions via [`NodeHandle::extension`].
    pub fn insert_extension<T: Any + Send + Sync>(&self, value: T) {
        self.handle
            .shared
            .extensions
            .write()
            .insert(TypeId::of::<T>(), Arc::new(value));
    }

    /// Bind the listener, start the dispatch thread and the accept loop.
    /// Returns the bound address.
    pub fn start(&self) -> Result<SocketAddr> {
        let shared = &self.handle.shared;
        if shared.started.swap(true, Ordering::AcqRel) {
            return Err(NodeError::AlreadyStarted);
        }

        let listener = self
            .bind()
            .inspect_err(|_| shared.started.store(false, Ordering::Release))?;
        let local_addr = listener.local_addr()?;
        let _ = shared.local_addr.set(local_addr);

        let handle = self.handle.clone();
        let thread = std::thread::Builder::new()
            .name("courier-dispatch".into())
            .spawn(move || dispatch_loop(handle))?;
        *self.exec_thread.lock() = Some(thread);

        self.io.spawn(accept_loop(
            shared.clone(),
            listener,
            shared.shutdown.subscribe(),
        ));

        tracing::info!(
            %local_addr,
            wait_for = shared.config.node.wait_for,
            "node listening"
        );
        Ok(local_addr)
    }

    fn bind(&self) -> Result<TcpListener> {
        let addr = self.handle.shared.config.listen_addr()?;
        let _guard = self.io.enter();
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        Ok(socket.listen(LISTEN_BACKLOG)?)
    }

    /// Drive the IO reactor on the calling thread until the node is stopped,
    /// then join the dispatch thread.
    pub fn run(&self) -> Result<()> {
        let shared = &self.handle.shared;
        if !shared.started.load(Ordering::Acquire) {
            return Err(NodeError::NotStarted);
        }

        let mut shutdown = shared.shutdown.subscribe();
        self.io.block_on(async move {
            let _ = shutdown.wait_for(|stopped| *stopped).await;
        });
        self.join_dispatch();
        tracing::info!("node stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    pub fn connect(&self, host: &str, port: u16) -> Result<Arc<Connection>> {
        self.handle.connect(host, port)
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.handle.local_addr()
    }

    pub fn peer_count(&self) -> usize {
        self.handle.peer_count()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.handle.connections()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.handle.stats()
    }

    fn join_dispatch(&self) {
        let Some(thread) = self.exec_thread.lock().take() else {
            return;
        };
        if thread.thread().id() == std::thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            tracing::error!("dispatch thread panicked");
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.handle.stop();
        self.join_dispatch();
        for conn in self.handle.shared.table.drain() {
            conn.close();
        }
        // Queued tasks and completions may hold handles back to `shared`.
        let dropped = self.handle.shared.queues.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "discarded queued work on drop");
        }
    }
}
