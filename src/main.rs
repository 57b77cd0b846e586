//! Test server for exercising client deadlines.
//!
//! ```text
//!   client (Communicator/Proxy)                 this process
//!   ──────────────────────────                  ───────────────────────────────
//!   connect ── ValidateConnection ◀──────────── ObjectAdapter (hold gate)
//!   invoke  ── Request ───────────────────────▶   └─ TimeoutServant "timeout"
//!           ◀─ Reply ─────────────────────────     op / sendData / sleep / raise
//!
//!   test driver ── HTTP ──────────────────────▶ controller
//!                                                hold?ms= / resume / shutdown / status
//! ```
//!
//! Usage: `rpc-deadlines [config.toml]`. Without a path, `RPC_DEADLINES_CONFIG`
//! is consulted, then built-in defaults are used.

use std::path::PathBuf;

use rpc_deadlines::config::{load_config, RuntimeConfig};
use rpc_deadlines::lifecycle::startup;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("RPC_DEADLINES_CONFIG").ok())
        .map(PathBuf::from);

    let config = match path {
        Some(path) => load_config(&path)?,
        None => RuntimeConfig::default(),
    };

    startup::run(config).await
}
