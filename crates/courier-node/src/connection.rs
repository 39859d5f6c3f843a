//! Per-peer connection -- framed read loop, queued write path.
//!
//! Each connection owns one TCP stream split into two IO tasks:
//!   reader: FramedRead<FrameCodec> → parcel queue
//!   writer: outbound frames → `write_all_buf(prefix.chain(payload))`
//!
//! Writes are requested from any thread, encoded on the dispatch thread and
//! completed on the IO reactor.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes};
use courier_protocol::codec::frame_header;
use courier_protocol::{encode_action, FrameCodec, ProtocolError, LENGTH_PREFIX_SIZE};
use crossbeam::channel::Sender;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::error::NodeError;
use crate::node::{LocalTask, NodeAction, NodeHandle};
use crate::queue::Parcel;
use crate::stats::NodeStats;
use crate::table::ConnectionTable;

/// Completion for a single write. Receives `Ok(())` once the OS accepted the
/// whole frame, or the error that prevented it.
pub type WriteDone = Box<dyn FnOnce(Result<(), NodeError>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn name(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// One encoded frame waiting for the writer task.
pub(crate) struct OutboundFrame {
    header: [u8; LENGTH_PREFIX_SIZE],
    payload: Bytes,
    done: Option<WriteDone>,
}

pub struct Connection {
    id: u64,
    remote: SocketAddr,
    local: SocketAddr,
    direction: Direction,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    local_tasks: Sender<LocalTask>,
    stats: Arc<NodeStats>,
    max_frame_bytes: usize,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("local", &self.local)
            .field("direction", &self.direction)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn complete(done: Option<WriteDone>, result: Result<(), NodeError>) {
    if let Some(done) = done {
        done(result);
    }
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        remote: SocketAddr,
        local: SocketAddr,
        direction: Direction,
        local_tasks: Sender<LocalTask>,
        stats: Arc<NodeStats>,
        max_frame_bytes: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            id,
            remote,
            local,
            direction,
            outbound,
            local_tasks,
            stats,
            max_frame_bytes,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        (conn, outbound_rx)
    }

    /// Process-unique id, distinguishes successive connections to one endpoint.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send `action` to the peer, fire and forget.
    pub fn write(self: &Arc<Self>, action: &NodeAction) {
        self.enqueue(action, None);
    }

    /// Send `action` to the peer; `done` runs once the write finished.
    ///
    /// The action is cloned immediately and encoded later on the dispatch
    /// thread. `done` normally runs on the IO reactor; a failure detected
    /// before the frame reaches the writer (closed connection, encode error,
    /// oversize frame) completes on the dispatch thread instead.
    pub fn write_with<F>(self: &Arc<Self>, action: &NodeAction, done: F)
    where
        F: FnOnce(Result<(), NodeError>) + Send + 'static,
    {
        self.enqueue(action, Some(Box::new(done)));
    }

    fn enqueue(self: &Arc<Self>, action: &NodeAction, done: Option<WriteDone>) {
        let conn = self.clone();
        let action = action.clone_action();
        let task: LocalTask = Box::new(move |_: &NodeHandle| {
            conn.write_now(&*action, done);
        });
        if self.local_tasks.send(task).is_err() {
            tracing::debug!(remote = %self.remote, "node gone, write dropped");
        }
    }

    /// Encode `action` and hand the frame to the writer task.
    pub(crate) fn write_now(&self, action: &NodeAction, done: Option<WriteDone>) {
        if self.is_closed() {
            complete(done, Err(NodeError::ConnectionClosed(self.remote)));
            return;
        }
        let payload = match encode_action(action) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(remote = %self.remote, tag = action.tag(), "encode failed: {e}");
                complete(done, Err(e.into()));
                return;
            }
        };
        if payload.len() > self.max_frame_bytes {
            let err = ProtocolError::FrameTooLarge {
                size: payload.len() as u64,
                max: self.max_frame_bytes,
            };
            complete(done, Err(err.into()));
            return;
        }

        tracing::debug!(
            remote = %self.remote,
            tag = action.tag(),
            len = payload.len(),
            "parcel queued for write"
        );
        let frame = OutboundFrame {
            header: frame_header(payload.len()),
            payload,
            done,
        };
        if let Err(mpsc::error::SendError(frame)) = self.outbound.send(frame) {
            complete(frame.done, Err(NodeError::ConnectionClosed(self.remote)));
        }
    }

    /// Stop both IO tasks. Pending writes complete with `ConnectionClosed`;
    /// the reader deregisters the connection from the table.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(remote = %self.remote, conn_id = self.id, "closing connection");
            self.cancel.cancel();
        }
    }

    /// Start the reader and writer tasks for `stream` on the IO reactor.
    pub(crate) fn spawn_io(
        self: &Arc<Self>,
        stream: TcpStream,
        outbound_rx: mpsc::UnboundedReceiver<OutboundFrame>,
        table: ConnectionTable,
        parcels: Sender<Parcel>,
        io: &Handle,
    ) {
        let (read_half, write_half) = stream.into_split();
        io.spawn(read_loop(self.clone(), read_half, table, parcels));
        io.spawn(write_loop(self.clone(), write_half, outbound_rx));
    }

    #[cfg(test)]
    pub(crate) fn detached(id: u64, remote: SocketAddr, direction: Direction) -> Arc<Self> {
        let (local_tasks, _) = crossbeam::channel::unbounded();
        let local = SocketAddr::from(([127, 0, 0, 1], 0));
        let (conn, _) = Self::new(
            id,
            remote,
            local,
            direction,
            local_tasks,
            Arc::new(NodeStats::new()),
            courier_protocol::DEFAULT_MAX_FRAME_BYTES,
        );
        conn
    }
}

async fn read_loop(
    conn: Arc<Connection>,
    read_half: OwnedReadHalf,
    table: ConnectionTable,
    parcels: Sender<Parcel>,
) {
    let remote = conn.remote;
    let mut frames = FramedRead::new(read_half, FrameCodec::new(conn.max_frame_bytes));

    loop {
        let next = tokio::select! {
            biased;
            _ = conn.cancel.cancelled() => break,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(payload)) => {
                NodeStats::incr(&conn.stats.frames_received);
                tracing::debug!(%remote, len = payload.len(), "parcel received");
                if parcels.send(Parcel { from: remote, payload }).is_err() {
                    break;
                }
            }
            Some(Err(e)) if e.is_violation() => {
                NodeStats::incr(&conn.stats.protocol_violations);
                tracing::warn!(%remote, conn_id = conn.id, "protocol violation: {e}");
                break;
            }
            Some(Err(e)) => {
                NodeStats::incr(&conn.stats.socket_errors);
                tracing::warn!(%remote, conn_id = conn.id, "read error: {e}");
                break;
            }
            None => {
                tracing::info!(%remote, conn_id = conn.id, "connection closed by peer");
                break;
            }
        }
    }

    conn.close();
    NodeStats::incr(&conn.stats.connections_closed);
    table.remove_if_current(&conn);
}

async fn write_loop(
    conn: Arc<Connection>,
    mut write_half: OwnedWriteHalf,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundFrame>,
) {
    let remote = conn.remote;

    loop {
        let frame = tokio::select! {
            biased;
            _ = conn.cancel.cancelled() => break,
            frame = outbound_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let len = LENGTH_PREFIX_SIZE + frame.payload.len();
        let mut buf = Bytes::copy_from_slice(&frame.header).chain(frame.payload);
        match write_half.write_all_buf(&mut buf).await {
            Ok(()) => {
                NodeStats::incr(&conn.stats.frames_written);
                conn.stats
                    .bytes_written
                    .fetch_add(len as u64, Ordering::Relaxed);
                complete(frame.done, Ok(()));
            }
            Err(e) => {
                NodeStats::incr(&conn.stats.socket_errors);
                tracing::warn!(%remote, conn_id = conn.id, "write error: {e}");
                complete(frame.done, Err(NodeError::Socket(e)));
                conn.close();
                break;
            }
        }
    }

    outbound_rx.close();
    while let Ok(frame) = outbound_rx.try_recv() {
        complete(frame.done, Err(NodeError::ConnectionClosed(remote)));
    }
    if let Err(e) = write_half.shutdown().await {
        tracing::debug!(%remote, "shutdown after close: {e}");
    }
}
