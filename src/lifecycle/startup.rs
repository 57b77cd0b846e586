//! Startup orchestration.
//!
//! # Responsibilities
//! - Initialize logging and metrics from the loaded configuration
//! - Start the test server (adapter + controller)
//! - Wait for a signal or a controller shutdown, then stop in order
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Listeners start last (traffic only when ready)

use std::net::SocketAddr;

use crate::config::RuntimeConfig;
use crate::lifecycle::{signals::shutdown_signal, Shutdown};
use crate::observability::{logging, metrics};
use crate::server::TestServer;

pub async fn run(config: RuntimeConfig) -> Result<(), Box<dyn std::error::Error>> {
    logging::init(&config.observability);

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config.observability.metrics_address.parse()?;
        metrics::init_metrics(addr);
    }

    let shutdown = Shutdown::new();
    let server = TestServer::start(&config.server, shutdown.clone()).await?;
    tracing::info!(proxy = %server.proxy_string(), "Ready");

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = server.wait() => tracing::info!("Shutdown requested by controller"),
    }

    server.stop().await;
    Ok(())
}
