//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → RuntimeConfig (validated, immutable)
//!     → ClientConfig to the Communicator, ServerConfig to the test server
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::ClientConfig;
pub use schema::ObservabilityConfig;
pub use schema::RetryConfig;
pub use schema::RuntimeConfig;
pub use schema::ServerConfig;
pub use schema::TimeoutConfig;
pub use schema::TransportConfig;
