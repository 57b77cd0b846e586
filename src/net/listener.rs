//! TCP listener implementation with backpressure.
//!
//! # Responsibilities
//! - Bind the object adapter's address with the configured receive buffer
//! - Accept incoming TCP connections
//! - Enforce max_connections limit via semaphore

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Semaphore;

use crate::config::ServerConfig;

/// Error type for listener operations.
#[derive(Debug)]
pub enum ListenerError {
    /// Failed to bind to address.
    Bind(std::io::Error),
    /// Failed to accept connection.
    Accept(std::io::Error),
    /// The connection limiter was shut down.
    Closed,
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerError::Bind(e) => write!(f, "Failed to bind: {}", e),
            ListenerError::Accept(e) => write!(f, "Failed to accept: {}", e),
            ListenerError::Closed => write!(f, "Listener closed"),
        }
    }
}

impl std::error::Error for ListenerError {}

/// A bounded TCP listener that limits concurrent connections.
///
/// When the limit is reached, new connections wait until a slot frees up.
pub struct Listener {
    inner: TcpListener,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    /// Bind to the configured address.
    ///
    /// `recv_buffer_size` is set on the listening socket so accepted
    /// connections inherit it before the handshake.
    pub async fn bind(config: &ServerConfig) -> Result<Self, ListenerError> {
        let addr: SocketAddr = config
            .bind_address
            .parse()
            .map_err(|e| ListenerError::Bind(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(ListenerError::Bind)?;
        socket.set_reuseaddr(true).map_err(ListenerError::Bind)?;
        if let Some(size) = config.recv_buffer_size {
            socket.set_recv_buffer_size(size).map_err(ListenerError::Bind)?;
        }
        socket.bind(addr).map_err(ListenerError::Bind)?;
        let listener = socket.listen(1024).map_err(ListenerError::Bind)?;

        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;

        tracing::info!(
            address = %local_addr,
            max_connections = config.max_connections,
            recv_buffer_size = ?config.recv_buffer_size,
            "Listener bound"
        );

        Ok(Self {
            inner: listener,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// Returns the stream and a permit that must be held for the connection's lifetime.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ListenerError> {
        // Acquire permit first (backpressure)
        let permit = self
            .connection_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Closed)?;

        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;
        let _ = stream.set_nodelay(true);

        tracing::debug!(
            peer_addr = %addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, ConnectionPermit { _permit: permit }))
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let config = ServerConfig {
            bind_address: "127.0.0.1:0".into(),
            recv_buffer_size: Some(50_000),
            max_connections: 2,
            ..ServerConfig::default()
        };
        let listener = Listener::bind(&config).await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
        assert_eq!(listener.max_connections(), 2);
    }

    #[tokio::test]
    async fn test_bind_rejects_bad_address() {
        let config = ServerConfig {
            bind_address: "nowhere".into(),
            ..ServerConfig::default()
        };
        assert!(matches!(Listener::bind(&config).await, Err(ListenerError::Bind(_))));
    }
}
