//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Proxy needs a connection:
//!     → retries.rs (connect retry loop, bounded attempts)
//!         → timeouts.rs (connect timeout per attempt)
//!         → backoff.rs (optional pause between attempts)
//!
//! Proxy issues a call:
//!     → timeouts.rs (idle timeout per read/write, invocation timeout per call)
//! ```
//!
//! # Design Decisions
//! - Three independent deadlines: connect, idle, invocation
//! - Only connect timeouts are retried, and only before a connection exists
//! - Timeout errors are distinct from each other and from other errors

pub mod backoff;
pub mod retries;
pub mod timeouts;

pub use retries::{connect_with_retry, ConnectAttempt, ConnectRetryPolicy};
pub use timeouts::{DeadlinePolicy, Timeout};
