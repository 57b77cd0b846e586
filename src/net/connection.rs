//! Connection state machine and lifecycle tracking.
//!
//! # Responsibilities
//! - Establish a client connection (TCP connect + validation) within the connect timeout
//! - Enforce the idle timeout on every in-flight read and write
//! - Own the table of pending invocations and fail them all when the connection dies
//! - Generate unique connection IDs for tracing
//! - Track incoming connections on the server side
//!
//! # Concurrency
//! ```text
//! callers ──frames──▶ mpsc ──▶ writer task ──▶ socket
//!                                   │ stall > idle → close(ConnectionTimeout)
//! socket ──▶ reader task ──replies──▶ pending[request_id] (oneshot)
//!                                   │ stall/EOF → close(ConnectionTimeout | ConnectionLost)
//!
//! close(reason): under the state mutex, Open → Closed happens once;
//! every pending oneshot receives the same reason exactly once.
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Notify};

use crate::config::TransportConfig;
use crate::error::{ErrorKind, RpcError, RpcResult};
use crate::net::endpoint::Endpoint;
use crate::net::frame::{
    encode_frame, read_with_progress, write_with_progress, FrameHeader, FrameKind, Reply, TransferError,
    HEADER_LEN,
};
use crate::observability::metrics;
use crate::resilience::Timeout;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state for lifecycle tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress.
    Connecting,
    /// Validated and usable.
    Open,
    /// Terminal. A closed connection is never reused.
    Closed,
}

/// How [`Connection::close`] treats the peer and pending invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionClose {
    /// Close immediately without notifying the peer.
    Forcefully,
    /// Send a close frame to the peer; pending invocations fail.
    Gracefully,
    /// Wait for pending invocations to complete, then close gracefully.
    GracefullyWithWait,
}

/// Snapshot of a connection's addressing and settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub endpoint: Endpoint,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub idle_timeout: Timeout,
}

type ReplySender = oneshot::Sender<RpcResult<Reply>>;
type CloseCallback = Box<dyn FnOnce(&RpcError) + Send>;

enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

struct Inner {
    state: ConnectionState,
    pending: HashMap<u32, ReplySender>,
    close_callbacks: Vec<CloseCallback>,
}

/// State shared between the handle and its reader/writer tasks.
struct Shared {
    id: ConnectionId,
    idle_timeout: Timeout,
    inner: Mutex<Inner>,
    /// `None` while open, the close reason once closed.
    closed_tx: watch::Sender<Option<RpcError>>,
    /// Signalled whenever the pending table becomes empty.
    drained: Notify,
}

impl Shared {
    fn new(id: ConnectionId, idle_timeout: Timeout) -> Self {
        let (closed_tx, _) = watch::channel(None);
        Self {
            id,
            idle_timeout,
            inner: Mutex::new(Inner {
                state: ConnectionState::Connecting,
                pending: HashMap::new(),
                close_callbacks: Vec::new(),
            }),
            closed_tx,
            drained: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking holder cannot leave the table half-updated; keep going.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn close_reason(&self) -> Option<RpcError> {
        self.closed_tx.borrow().clone()
    }

    /// Transition to Closed. Returns false if another party already closed it.
    fn close(&self, reason: RpcError) -> bool {
        let callbacks = {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Closed {
                return false;
            }
            let was_open = inner.state == ConnectionState::Open;
            inner.state = ConnectionState::Closed;
            self.closed_tx.send_replace(Some(reason.clone()));

            for (_, tx) in inner.pending.drain() {
                let _ = tx.send(Err(reason.clone()));
            }
            if was_open {
                metrics::record_connection_closed(reason.kind());
            }
            std::mem::take(&mut inner.close_callbacks)
        };
        self.drained.notify_waiters();

        match reason.kind() {
            ErrorKind::ConnectionClosed => {
                tracing::debug!(connection_id = %self.id, "Connection closed by application")
            }
            _ => tracing::info!(connection_id = %self.id, reason = %reason, "Connection closed"),
        }

        for callback in callbacks {
            callback(&reason);
        }
        true
    }

    fn transfer_failed(&self, err: TransferError) -> RpcError {
        match err {
            TransferError::Stalled => {
                metrics::record_timeout(ErrorKind::ConnectionTimeout);
                tracing::warn!(
                    connection_id = %self.id,
                    timeout_ms = self.idle_timeout.as_millis(),
                    "No transport progress within idle timeout"
                );
                RpcError::ConnectionTimeout {
                    connection: self.id,
                    timeout_ms: self.idle_timeout.as_millis(),
                }
            }
            TransferError::Closed => RpcError::ConnectionLost {
                connection: self.id,
                reason: "peer closed the connection".into(),
            },
            TransferError::Io(e) => RpcError::ConnectionLost {
                connection: self.id,
                reason: e.to_string(),
            },
        }
    }

    /// Hand a reply to its waiter. Replies nobody waits for any more are dropped.
    fn complete(&self, request_id: u32, reply: Reply) {
        let mut inner = self.lock();
        match inner.pending.remove(&request_id) {
            Some(tx) => {
                let _ = tx.send(Ok(reply));
                if inner.pending.is_empty() {
                    self.drained.notify_waiters();
                }
            }
            None => {
                metrics::record_late_reply();
                tracing::debug!(
                    connection_id = %self.id,
                    request_id,
                    "Discarding reply for abandoned invocation"
                );
            }
        }
    }
}

/// A client connection to one endpoint.
///
/// Shared by every proxy whose calls resolve to the same endpoint and idle
/// timeout. Equality is identity: two handles are equal when they refer to
/// the same underlying session.
pub struct Connection {
    info: ConnectionInfo,
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    next_request_id: AtomicU32,
    max_message_size: usize,
}

impl Connection {
    /// Connect and validate within `connect_timeout`, then start the reader and writer tasks.
    ///
    /// A timeout anywhere in the handshake is `ConnectTimeout`; any other
    /// failure is `ConnectFailed` or `Protocol`.
    pub async fn establish(
        endpoint: &Endpoint,
        connect_timeout: Timeout,
        idle_timeout: Timeout,
        transport: &TransportConfig,
    ) -> RpcResult<Arc<Connection>> {
        let id = ConnectionId::new();
        let shared = Arc::new(Shared::new(id, idle_timeout));

        tracing::debug!(
            connection_id = %id,
            endpoint = %endpoint,
            connect_timeout = %connect_timeout,
            "Connecting"
        );

        let stream = match connect_timeout.run(handshake(endpoint, transport)).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::debug!(connection_id = %id, endpoint = %endpoint, "Connect timed out");
                return Err(RpcError::ConnectTimeout {
                    endpoint: endpoint.to_string(),
                    timeout_ms: connect_timeout.as_millis(),
                });
            }
        };

        let failed = |e: std::io::Error| RpcError::ConnectFailed {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        };
        let local_addr = stream.local_addr().map_err(failed)?;
        let remote_addr = stream.peer_addr().map_err(failed)?;
        let (reader, writer) = stream.into_split();
        let (outgoing, rx) = mpsc::unbounded_channel();

        shared.lock().state = ConnectionState::Open;
        metrics::record_connection_opened();

        tokio::spawn(write_loop(shared.clone(), writer, rx));
        tokio::spawn(read_loop(shared.clone(), reader, transport.max_message_size));

        tracing::info!(
            connection_id = %id,
            endpoint = %endpoint,
            local_addr = %local_addr,
            idle_timeout = %idle_timeout,
            "Connection established"
        );

        Ok(Arc::new(Connection {
            info: ConnectionInfo {
                id,
                endpoint: endpoint.clone(),
                local_addr,
                remote_addr,
                idle_timeout,
            },
            shared,
            outgoing,
            next_request_id: AtomicU32::new(1),
            max_message_size: transport.max_message_size,
        }))
    }

    pub fn id(&self) -> ConnectionId {
        self.info.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.info.endpoint
    }

    pub fn idle_timeout(&self) -> Timeout {
        self.info.idle_timeout
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Snapshot of the current state; may change right after it is read.
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Why the connection closed, or `None` while it is open.
    pub fn close_reason(&self) -> Option<RpcError> {
        self.shared.close_reason()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Resolve once the connection is closed, with the close reason.
    pub async fn wait_closed(&self) -> RpcError {
        let mut rx = self.shared.closed_tx.subscribe();
        let reason = match rx.wait_for(|r| r.is_some()).await {
            Ok(reason) => reason.clone(),
            Err(_) => None,
        };
        reason.unwrap_or(RpcError::ConnectionClosed {
            connection: self.info.id,
            graceful: false,
        })
    }

    /// Register a callback run once when the connection closes.
    ///
    /// Runs immediately if the connection is already closed.
    pub fn set_close_callback<F>(&self, callback: F)
    where
        F: FnOnce(&RpcError) + Send + 'static,
    {
        {
            let mut inner = self.shared.lock();
            if inner.state != ConnectionState::Closed {
                inner.close_callbacks.push(Box::new(callback));
                return;
            }
        }
        if let Some(reason) = self.close_reason() {
            callback(&reason);
        }
    }

    /// Close the connection. Pending invocations fail with `ConnectionClosed`
    /// unless `GracefullyWithWait` lets them finish first.
    pub async fn close(&self, mode: ConnectionClose) {
        match mode {
            ConnectionClose::Forcefully => {
                self.shared.close(RpcError::ConnectionClosed {
                    connection: self.info.id,
                    graceful: false,
                });
            }
            ConnectionClose::Gracefully => self.close_gracefully().await,
            ConnectionClose::GracefullyWithWait => {
                loop {
                    let drained = self.shared.drained.notified();
                    tokio::pin!(drained);
                    drained.as_mut().enable();
                    if self.pending_count() == 0 || !self.is_open() {
                        break;
                    }
                    drained.await;
                }
                self.close_gracefully().await;
            }
        }
    }

    async fn close_gracefully(&self) {
        if self.outgoing.send(Outgoing::Close).is_err() {
            return;
        }
        self.wait_closed().await;
    }

    /// Allocate a request id and register a waiter for its reply.
    ///
    /// Fails with the close reason if the connection is already closed, so a
    /// waiter can never be registered on a dead connection.
    pub(crate) fn register_pending(&self) -> RpcResult<(u32, oneshot::Receiver<RpcResult<Reply>>)> {
        let mut inner = self.shared.lock();
        if inner.state == ConnectionState::Closed {
            drop(inner);
            return Err(self.closed_error());
        }
        let request_id = loop {
            let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !inner.pending.contains_key(&id) {
                break id;
            }
        };
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(request_id, tx);
        Ok((request_id, rx))
    }

    /// Drop the waiter for `request_id`. Returns false if a producer already claimed it.
    pub(crate) fn abandon_pending(&self, request_id: u32) -> bool {
        let mut inner = self.shared.lock();
        let removed = inner.pending.remove(&request_id).is_some();
        if removed && inner.pending.is_empty() {
            self.shared.drained.notify_waiters();
        }
        removed
    }

    /// Largest frame body sent or accepted on this connection.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Queue a request frame for the writer task.
    pub(crate) fn send_request(&self, request_id: u32, body: &[u8]) -> RpcResult<()> {
        let frame = encode_frame(FrameKind::Request, request_id, body);
        self.outgoing
            .send(Outgoing::Frame(frame))
            .map_err(|_| self.closed_error())
    }

    fn closed_error(&self) -> RpcError {
        self.close_reason().unwrap_or(RpcError::ConnectionClosed {
            connection: self.info.id,
            graceful: false,
        })
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.info.id == other.info.id
    }
}

impl Eq for Connection {}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.info.id)
            .field("endpoint", &self.info.endpoint.to_string())
            .field("local_addr", &self.info.local_addr)
            .field("idle_timeout", &self.info.idle_timeout)
            .field("state", &self.state())
            .finish()
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} local address = {} remote address = {}",
            self.info.id, self.info.local_addr, self.info.remote_addr
        )
    }
}

/// TCP connect plus waiting for the server's validation frame.
async fn handshake(endpoint: &Endpoint, transport: &TransportConfig) -> RpcResult<TcpStream> {
    let failed = |reason: String| RpcError::ConnectFailed {
        endpoint: endpoint.to_string(),
        reason,
    };

    let addr = tokio::net::lookup_host(endpoint.authority())
        .await
        .map_err(|e| failed(e.to_string()))?
        .next()
        .ok_or_else(|| failed("no address resolved".into()))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| failed(e.to_string()))?;
    if let Some(size) = transport.send_buffer_size {
        socket.set_send_buffer_size(size).map_err(|e| failed(e.to_string()))?;
    }
    if let Some(size) = transport.recv_buffer_size {
        socket.set_recv_buffer_size(size).map_err(|e| failed(e.to_string()))?;
    }

    let mut stream = socket.connect(addr).await.map_err(|e| failed(e.to_string()))?;
    let _ = stream.set_nodelay(true);

    let mut raw = [0u8; HEADER_LEN];
    read_with_progress(&mut stream, &mut raw, Timeout::Infinite)
        .await
        .map_err(|e| failed(format!("validation failed: {}", e)))?;
    let header = FrameHeader::decode(&raw, 0)?;
    if header.kind != FrameKind::ValidateConnection {
        return Err(RpcError::Protocol(format!(
            "expected connection validation, got {:?}",
            header.kind
        )));
    }
    Ok(stream)
}

/// Single writer: at most one write, and one idle-timeout decision, in flight.
async fn write_loop(shared: Arc<Shared>, mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Outgoing>) {
    let mut closed = shared.closed_tx.subscribe();

    loop {
        let next = tokio::select! {
            msg = rx.recv() => msg,
            _ = closed.wait_for(|r| r.is_some()) => break,
        };

        let (bytes, closing) = match next {
            Some(Outgoing::Frame(bytes)) => (bytes, false),
            Some(Outgoing::Close) => (encode_frame(FrameKind::CloseConnection, 0, &[]), true),
            None => {
                // Every handle is gone; nobody can issue calls on this connection again.
                shared.close(RpcError::ConnectionClosed {
                    connection: shared.id,
                    graceful: false,
                });
                break;
            }
        };

        let result = tokio::select! {
            r = write_with_progress(&mut writer, &bytes, shared.idle_timeout) => r,
            _ = closed.wait_for(|r| r.is_some()) => break,
        };

        match result {
            Ok(()) if closing => {
                shared.close(RpcError::ConnectionClosed {
                    connection: shared.id,
                    graceful: true,
                });
                let _ = writer.shutdown().await;
                break;
            }
            Ok(()) => {}
            Err(e) => {
                let reason = shared.transfer_failed(e);
                shared.close(reason);
                break;
            }
        }
    }
    tracing::trace!(connection_id = %shared.id, "Writer task exiting");
}

async fn read_loop(shared: Arc<Shared>, mut reader: OwnedReadHalf, max_message_size: usize) {
    let mut closed = shared.closed_tx.subscribe();
    let reason = tokio::select! {
        reason = read_replies(&shared, &mut reader, max_message_size) => reason,
        _ = closed.wait_for(|r| r.is_some()) => return,
    };
    shared.close(reason);
}

/// Read frames until something goes wrong; returns the reason to close with.
async fn read_replies(shared: &Shared, reader: &mut OwnedReadHalf, max_message_size: usize) -> RpcError {
    loop {
        let mut raw = [0u8; HEADER_LEN];
        // Waiting for the first byte of a frame is unbounded: an idle
        // connection with outstanding calls is healthy. Once a frame has
        // started, every read must make progress within the idle timeout.
        if let Err(e) = read_with_progress(reader, &mut raw[..1], Timeout::Infinite).await {
            return shared.transfer_failed(e);
        }
        if let Err(e) = read_with_progress(reader, &mut raw[1..], shared.idle_timeout).await {
            return shared.transfer_failed(e);
        }
        let header = match FrameHeader::decode(&raw, max_message_size) {
            Ok(header) => header,
            Err(e) => return e,
        };

        let mut body = vec![0u8; header.body_len as usize];
        if let Err(e) = read_with_progress(reader, &mut body, shared.idle_timeout).await {
            return shared.transfer_failed(e);
        }

        match header.kind {
            FrameKind::Reply => match Reply::decode_body(body) {
                Ok(reply) => shared.complete(header.request_id, reply),
                Err(e) => return e,
            },
            FrameKind::CloseConnection => {
                return RpcError::ConnectionLost {
                    connection: shared.id,
                    reason: "peer closed the connection gracefully".into(),
                }
            }
            FrameKind::ValidateConnection => {}
            FrameKind::Request => {
                return RpcError::Protocol("unexpected request frame on a client connection".into())
            }
        }
    }
}

/// Tracks incoming connections on the server side.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    /// Current count of active connections.
    active_count: Arc<AtomicU64>,
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new active connection. Returns a guard that decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id: ConnectionId::new(),
        }
    }

    /// Get current active connection count.
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(connection_id = %self.id, "Incoming connection closed");
    }
}
