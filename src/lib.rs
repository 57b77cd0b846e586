//! Client-side deadline enforcement for a request/response RPC runtime.
//!
//! Three independent deadlines govern every call:
//! - connect: TCP connect plus connection validation, retried on timeout
//! - idle: no read or write progress on an open connection; kills the connection
//! - invocation: caller stops waiting for a reply; the connection survives

pub mod client;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod server;

pub use client::{Communicator, InvocationHandle, Proxy};
pub use config::RuntimeConfig;
pub use error::{ErrorKind, RpcError, RpcResult};
pub use lifecycle::Shutdown;
pub use net::connection::{Connection, ConnectionClose, ConnectionState};
pub use resilience::{DeadlinePolicy, Timeout};
