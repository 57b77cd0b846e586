//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Client runtime and test server produce:
//!     → logging.rs (subscriber setup for structured log events)
//!     → metrics.rs (connect attempts, timeouts by kind, connection closes)
//!     → tracing.rs (invocation and dispatch spans)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```
//!
//! # Design Decisions
//! - Every deadline expiry is logged with the deadline kind and value
//! - Metrics are cheap and no-ops without an installed recorder

pub mod logging;
pub mod metrics;
pub mod tracing;
