//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;

use rpc_deadlines::config::{ClientConfig, ServerConfig, TransportConfig};
use rpc_deadlines::server::TestServer;
use rpc_deadlines::{Communicator, Shutdown};

/// Socket buffer size on both sides. Small buffers make a held server stall
/// client writes after a few hundred kilobytes.
pub const BUFFER_SIZE: u32 = 50_000;

/// Start the test server on ephemeral ports.
pub async fn start_server() -> TestServer {
    let config = ServerConfig {
        bind_address: "127.0.0.1:0".into(),
        controller_address: "127.0.0.1:0".into(),
        recv_buffer_size: Some(BUFFER_SIZE),
        ..ServerConfig::default()
    };
    TestServer::start(&config, Shutdown::new()).await.unwrap()
}

pub fn client_config() -> ClientConfig {
    ClientConfig {
        transport: TransportConfig {
            send_buffer_size: Some(BUFFER_SIZE),
            ..TransportConfig::default()
        },
        ..ClientConfig::default()
    }
}

pub fn communicator() -> Communicator {
    Communicator::new(client_config()).unwrap()
}

/// A listener that accepts TCP connections but never validates them.
///
/// Returns its address and the number of connections accepted so far.
pub async fn start_stalling_listener() -> (SocketAddr, Arc<AtomicU32>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicU32::new(0));
    let counter = accepted.clone();

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            held.push(socket);
        }
    });

    (addr, accepted)
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
