//! Client runtime subsystem.
//!
//! # Data Flow
//! ```text
//! Communicator (config, pool)
//!     → Proxy (identity, endpoint, DeadlinePolicy)
//!     → pool.rs (shared connection per endpoint + idle timeout,
//!                connect retry loop under the connect timeout)
//!     → invocation.rs (pending entry, invocation deadline)
//!     → net::connection (framed I/O under the idle timeout)
//! ```
//!
//! # Design Decisions
//! - Proxies are values; deriving one never changes another
//! - Invocation expiry abandons the call, connection expiry kills the connection

pub mod communicator;
pub mod invocation;
pub mod pool;
pub mod proxy;

pub use communicator::Communicator;
pub use invocation::InvocationHandle;
pub use proxy::Proxy;
