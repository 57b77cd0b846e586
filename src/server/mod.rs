//! Test server subsystem.
//!
//! # Data Flow
//! ```text
//! TestServer::start
//!     → adapter.rs (listener, hold gate, request dispatch)
//!     → servant.rs (TimeoutServant registered as "timeout")
//!     → controller.rs (HTTP hold/resume/shutdown/status)
//! ```
//!
//! # Design Decisions
//! - Adapter and controller share one Shutdown; either side can stop both
//! - The adapter is activated last, after the servant is registered

pub mod adapter;
pub mod controller;
pub mod servant;

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::lifecycle::Shutdown;
use crate::net::endpoint::Endpoint;
use crate::net::listener::ListenerError;

pub use adapter::{AdapterState, ObjectAdapter};
pub use servant::{Servant, TimeoutServant};

/// Identity the timeout servant is registered under.
pub const TIMEOUT_IDENTITY: &str = "timeout";

#[derive(Debug, Error)]
pub enum StartError {
    #[error("object adapter: {0}")]
    Adapter(#[from] ListenerError),

    #[error("controller: {0}")]
    Controller(#[from] std::io::Error),
}

/// An object adapter serving [`TimeoutServant`] plus its controller.
#[derive(Debug)]
pub struct TestServer {
    adapter: ObjectAdapter,
    controller_addr: SocketAddr,
    shutdown: Shutdown,
    controller: JoinHandle<std::io::Result<()>>,
}

impl TestServer {
    pub async fn start(config: &ServerConfig, shutdown: Shutdown) -> Result<Self, StartError> {
        let adapter = ObjectAdapter::bind(config, &shutdown).await?;
        adapter.add(TIMEOUT_IDENTITY, Arc::new(TimeoutServant));

        let listener = TcpListener::bind(&config.controller_address).await?;
        let controller_addr = listener.local_addr()?;
        let controller = tokio::spawn(controller::serve(
            listener,
            controller::ControllerState {
                adapter: adapter.clone(),
                shutdown: shutdown.clone(),
            },
            shutdown.subscribe(),
        ));

        adapter.activate();
        tracing::info!(
            endpoint = %adapter.endpoint(),
            controller = %controller_addr,
            "Test server started"
        );

        Ok(Self {
            adapter,
            controller_addr,
            shutdown,
            controller,
        })
    }

    pub fn adapter(&self) -> &ObjectAdapter {
        &self.adapter
    }

    pub fn endpoint(&self) -> Endpoint {
        self.adapter.endpoint()
    }

    /// `timeout:tcp://host:port`
    pub fn proxy_string(&self) -> String {
        format!("{}:{}", TIMEOUT_IDENTITY, self.endpoint())
    }

    pub fn controller_url(&self) -> String {
        format!("http://{}", self.controller_addr)
    }

    /// Resolve once a shutdown was requested (controller or caller).
    pub async fn wait(&self) {
        self.adapter.wait_for_deactivate().await;
    }

    /// Deactivate the adapter and stop the controller.
    pub async fn stop(self) {
        self.adapter.deactivate();
        self.shutdown.trigger();
        match self.controller.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Controller stopped with error"),
            Err(e) => tracing::warn!(error = %e, "Controller task failed"),
        }
        tracing::info!("Test server stopped");
    }
}
