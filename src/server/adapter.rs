//! Object adapter: accepts connections and dispatches requests to servants.
//!
//! # Responsibilities
//! - Accept connections and validate them once the adapter is active
//! - Read framed requests and dispatch each one concurrently
//! - Hold: stop reading from sockets so client writes back up
//! - Deactivate: stop accepting and drop every connection
//!
//! # Data Flow
//! ```text
//! Listener.accept()
//!     → wait until Active → send ValidateConnection
//!     → loop: (gate) header → (gate) body chunk → (gate) body chunk ...
//!     → spawn dispatch → servant → reply frame (shared writer)
//! ```
//!
//! # Design Decisions
//! - The hold gate sits before every header and between body chunks, so a
//!   held adapter stops draining the socket mid-request and the client's
//!   send buffer fills
//! - Replies for requests already dispatched are still written while held

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::Instrument;

use crate::client::proxy::PING_OPERATION;
use crate::config::ServerConfig;
use crate::lifecycle::Shutdown;
use crate::net::connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
use crate::net::endpoint::Endpoint;
use crate::net::frame::{encode_frame, FrameHeader, FrameKind, Reply, ReplyStatus, Request, HEADER_LEN};
use crate::net::listener::{ConnectionPermit, Listener, ListenerError};
use crate::observability::tracing::dispatch_span;

use super::servant::Servant;

/// Largest slice of a request body read between two hold checks.
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
    /// Connections are accepted but not validated, and no request bytes are read.
    Held,
    Active,
    /// Terminal.
    Deactivated,
}

struct AdapterInner {
    servants: DashMap<String, Arc<dyn Servant>>,
    state: watch::Sender<AdapterState>,
    /// Bumped on every explicit state change; a timed hold only resumes if it is still current.
    generation: AtomicU64,
    tracker: ConnectionTracker,
    local_addr: SocketAddr,
    max_message_size: usize,
}

impl AdapterInner {
    fn set_state(&self, next: AdapterState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == AdapterState::Deactivated || *state == next {
                return false;
            }
            *state = next;
            true
        })
    }

    /// Wait until the adapter leaves `Held`. Returns false once deactivated.
    async fn wait_until_active(&self) -> bool {
        let mut rx = self.state.subscribe();
        let active = match rx.wait_for(|s| *s != AdapterState::Held).await {
            Ok(state) => *state == AdapterState::Active,
            Err(_) => false,
        };
        active
    }
}

/// Handle to a running object adapter. Cheap to clone.
#[derive(Clone)]
pub struct ObjectAdapter {
    inner: Arc<AdapterInner>,
}

impl ObjectAdapter {
    /// Bind the listener and start accepting. The adapter starts `Held`.
    pub async fn bind(config: &ServerConfig, shutdown: &Shutdown) -> Result<Self, ListenerError> {
        let listener = Listener::bind(config).await?;
        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;
        let (state, _) = watch::channel(AdapterState::Held);

        let inner = Arc::new(AdapterInner {
            servants: DashMap::new(),
            state,
            generation: AtomicU64::new(0),
            tracker: ConnectionTracker::new(),
            local_addr,
            max_message_size: config.max_message_size,
        });

        tokio::spawn(accept_loop(inner.clone(), listener, shutdown.subscribe()));
        Ok(Self { inner })
    }

    /// Register `servant` under `identity`, replacing any previous one.
    pub fn add(&self, identity: &str, servant: Arc<dyn Servant>) {
        self.inner.servants.insert(identity.to_string(), servant);
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::from(self.inner.local_addr)
    }

    pub fn state(&self) -> AdapterState {
        *self.inner.state.borrow()
    }

    pub fn open_connections(&self) -> u64 {
        self.inner.tracker.active_count()
    }

    pub fn activate(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if self.inner.set_state(AdapterState::Active) {
            tracing::info!(address = %self.inner.local_addr, "Adapter active");
        }
    }

    pub fn hold(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if self.inner.set_state(AdapterState::Held) {
            tracing::info!(address = %self.inner.local_addr, "Adapter held");
        }
    }

    /// Hold, then resume after `ms` milliseconds. A negative value holds until
    /// [`activate`](Self::activate) is called.
    pub fn hold_for(&self, ms: i64) {
        self.hold();
        if ms < 0 {
            return;
        }

        let generation = self.inner.generation.load(Ordering::SeqCst);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms as u64)).await;
            // A later hold/activate supersedes this timer.
            if inner.generation.load(Ordering::SeqCst) == generation && inner.set_state(AdapterState::Active) {
                tracing::info!(address = %inner.local_addr, held_ms = ms, "Adapter resumed after timed hold");
            }
        });
    }

    /// Resolve once the adapter is held or deactivated.
    pub async fn wait_for_hold(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s != AdapterState::Active).await;
    }

    /// Stop accepting and close every connection. Irreversible.
    pub fn deactivate(&self) {
        if self.inner.set_state(AdapterState::Deactivated) {
            tracing::info!(address = %self.inner.local_addr, "Adapter deactivated");
        }
    }

    pub async fn wait_for_deactivate(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s == AdapterState::Deactivated).await;
    }
}

impl std::fmt::Debug for ObjectAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectAdapter")
            .field("local_addr", &self.inner.local_addr)
            .field("state", &self.state())
            .field("open_connections", &self.open_connections())
            .finish()
    }
}

async fn accept_loop(inner: Arc<AdapterInner>, listener: Listener, mut shutdown: broadcast::Receiver<()>) {
    let mut state = inner.state.subscribe();

    loop {
        let accepted = tokio::select! {
            r = listener.accept() => r,
            _ = shutdown.recv() => break,
            _ = state.wait_for(|s| *s == AdapterState::Deactivated) => break,
        };

        match accepted {
            Ok((stream, peer_addr, permit)) => {
                let guard = inner.tracker.track();
                tokio::spawn(serve_connection(inner.clone(), stream, peer_addr, permit, guard));
            }
            Err(ListenerError::Closed) => break,
            Err(e) => tracing::warn!(error = %e, "Accept failed"),
        }
    }

    inner.set_state(AdapterState::Deactivated);
    tracing::debug!(address = %inner.local_addr, "Accept loop stopped");
}

async fn serve_connection(
    inner: Arc<AdapterInner>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    _permit: ConnectionPermit,
    guard: ConnectionGuard,
) {
    let connection_id = guard.id();
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));
    let mut state = inner.state.subscribe();

    let result = tokio::select! {
        r = read_requests(&inner, connection_id, &mut reader, &writer) => r,
        _ = state.wait_for(|s| *s == AdapterState::Deactivated) => Ok(()),
    };

    match result {
        Ok(()) => tracing::debug!(connection_id = %connection_id, peer_addr = %peer_addr, "Connection finished"),
        Err(e) => tracing::debug!(connection_id = %connection_id, peer_addr = %peer_addr, error = %e, "Connection failed"),
    }
}

async fn read_requests(
    inner: &Arc<AdapterInner>,
    connection_id: ConnectionId,
    reader: &mut OwnedReadHalf,
    writer: &Arc<Mutex<OwnedWriteHalf>>,
) -> std::io::Result<()> {
    if !inner.wait_until_active().await {
        return Ok(());
    }
    let validate = FrameHeader::new(FrameKind::ValidateConnection, 0, 0).encode();
    writer.lock().await.write_all(&validate).await?;

    loop {
        if !inner.wait_until_active().await {
            return Ok(());
        }
        reader.readable().await?;
        // A hold may have started while the connection sat idle.
        if !inner.wait_until_active().await {
            return Ok(());
        }
        let mut raw = [0u8; HEADER_LEN];
        match reader.read_exact(&mut raw).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
        let header = FrameHeader::decode(&raw, inner.max_message_size)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut body = vec![0u8; header.body_len as usize];
        let mut filled = 0;
        while filled < body.len() {
            if !inner.wait_until_active().await {
                return Ok(());
            }
            let end = (filled + READ_CHUNK).min(body.len());
            let n = reader.read(&mut body[filled..end]).await?;
            if n == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            filled += n;
        }

        match header.kind {
            FrameKind::Request => {
                let request = Request::decode_body(body)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                let span = dispatch_span(connection_id, header.request_id, &request.identity, &request.operation);
                tokio::spawn(
                    dispatch(inner.clone(), writer.clone(), header.request_id, request).instrument(span),
                );
            }
            FrameKind::CloseConnection => return Ok(()),
            FrameKind::ValidateConnection | FrameKind::Reply => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unexpected {:?} frame from client", header.kind),
                ))
            }
        }
    }
}

async fn dispatch(inner: Arc<AdapterInner>, writer: Arc<Mutex<OwnedWriteHalf>>, request_id: u32, request: Request) {
    let servant = inner.servants.get(&request.identity).map(|entry| entry.value().clone());

    let reply = match servant {
        None => Reply::failure(ReplyStatus::ObjectNotExist, request.identity.clone()),
        Some(_) if request.operation == PING_OPERATION => Reply::ok(Vec::new()),
        Some(servant) => match servant.dispatch(&request.operation, request.payload).await {
            Ok(payload) => Reply::ok(payload),
            Err(e) => e.into_reply(),
        },
    };
    tracing::trace!(status = ?reply.status, "Dispatch complete");

    let frame = encode_frame(FrameKind::Reply, request_id, &reply.encode_body());
    if let Err(e) = writer.lock().await.write_all(&frame).await {
        tracing::debug!(error = %e, "Failed to write reply");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ServerConfig {
        ServerConfig {
            bind_address: "127.0.0.1:0".into(),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let shutdown = Shutdown::new();
        let adapter = ObjectAdapter::bind(&config(), &shutdown).await.unwrap();
        assert_eq!(adapter.state(), AdapterState::Held);

        adapter.activate();
        assert_eq!(adapter.state(), AdapterState::Active);

        adapter.hold_for(20);
        assert_eq!(adapter.state(), AdapterState::Held);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(adapter.state(), AdapterState::Active);

        adapter.deactivate();
        adapter.activate();
        assert_eq!(adapter.state(), AdapterState::Deactivated);
    }

    #[tokio::test]
    async fn test_superseded_timed_hold_does_not_resume() {
        let shutdown = Shutdown::new();
        let adapter = ObjectAdapter::bind(&config(), &shutdown).await.unwrap();
        adapter.activate();

        adapter.hold_for(20);
        adapter.hold_for(-1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(adapter.state(), AdapterState::Held);
    }

    #[tokio::test]
    async fn test_held_adapter_reads_nothing_until_resumed() {
        use crate::server::servant::TimeoutServant;
        use tokio::net::TcpStream;

        let shutdown = Shutdown::new();
        let adapter = ObjectAdapter::bind(&config(), &shutdown).await.unwrap();
        adapter.add("timeout", Arc::new(TimeoutServant));
        adapter.activate();

        let mut client = TcpStream::connect(adapter.local_addr()).await.unwrap();
        let mut raw = [0u8; HEADER_LEN];
        client.read_exact(&mut raw).await.unwrap();
        assert_eq!(FrameHeader::decode(&raw, 0).unwrap().kind, FrameKind::ValidateConnection);

        adapter.hold();
        let request = Request {
            identity: "timeout".into(),
            operation: PING_OPERATION.into(),
            payload: Vec::new(),
        };
        let frame = encode_frame(FrameKind::Request, 7, &request.encode_body().unwrap());
        client.write_all(&frame).await.unwrap();

        let held = tokio::time::timeout(Duration::from_millis(200), client.read_exact(&mut raw)).await;
        assert!(held.is_err());

        adapter.activate();
        tokio::time::timeout(Duration::from_secs(1), client.read_exact(&mut raw))
            .await
            .unwrap()
            .unwrap();
        let header = FrameHeader::decode(&raw, 1024).unwrap();
        assert_eq!(header.kind, FrameKind::Reply);
        assert_eq!(header.request_id, 7);
    }

    #[tokio::test]
    async fn test_shutdown_deactivates() {
        let shutdown = Shutdown::new();
        let adapter = ObjectAdapter::bind(&config(), &shutdown).await.unwrap();
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), adapter.wait_for_deactivate())
            .await
            .unwrap();
        assert_eq!(adapter.state(), AdapterState::Deactivated);
    }
}
