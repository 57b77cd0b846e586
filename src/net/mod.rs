//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Client side:
//!     endpoint.rs (tcp://host:port?timeout=ms)
//!     → connection.rs (connect + validate under the connect timeout)
//!     → frame.rs (framed requests/replies, idle progress timeout per read/write)
//!
//! Server side:
//!     listener.rs (accept loop, connection limits)
//!     → server::adapter (validation, dispatch)
//!
//! Connection States:
//!     Connecting → Open → Closed
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - A closed connection is never reopened; callers get a fresh one
//! - The idle timeout measures progress, not total transfer time

pub mod connection;
pub mod endpoint;
pub mod frame;
pub mod listener;
