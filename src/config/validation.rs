//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts are -1 or > 0, attempt budget >= 1)
//! - Validate addresses parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: RuntimeConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::RuntimeConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &RuntimeConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let timeouts = &config.client.timeouts;
    for (field, value) in [
        ("client.timeouts.connect_ms", timeouts.connect_ms),
        ("client.timeouts.idle_ms", timeouts.idle_ms),
        ("client.timeouts.invocation_ms", timeouts.invocation_ms),
    ] {
        if value != -1 && value <= 0 {
            errors.push(ValidationError::new(
                field,
                format!("{} is invalid, use -1 for infinite or a positive value", value),
            ));
        }
    }

    let retries = &config.client.retries;
    if retries.connect_attempts == 0 {
        errors.push(ValidationError::new(
            "client.retries.connect_attempts",
            "must allow at least one attempt",
        ));
    }
    if retries.max_delay_ms < retries.base_delay_ms {
        errors.push(ValidationError::new(
            "client.retries.max_delay_ms",
            "must be greater than or equal to base_delay_ms",
        ));
    }

    if config.client.transport.max_message_size == 0 {
        errors.push(ValidationError::new(
            "client.transport.max_message_size",
            "must be greater than 0",
        ));
    }
    if config.server.max_message_size == 0 {
        errors.push(ValidationError::new(
            "server.max_message_size",
            "must be greater than 0",
        ));
    }
    if config.server.max_connections == 0 {
        errors.push(ValidationError::new(
            "server.max_connections",
            "must be greater than 0",
        ));
    }

    for (field, addr) in [
        ("server.bind_address", &config.server.bind_address),
        ("server.controller_address", &config.server.controller_address),
        ("observability.metrics_address", &config.observability.metrics_address),
    ] {
        if addr.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new(field, format!("`{}` is not a socket address", addr)));
        }
    }

    match config.observability.log_format.as_str() {
        "pretty" | "json" => {}
        other => errors.push(ValidationError::new(
            "observability.log_format",
            format!("unknown format `{}`", other),
        )),
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&RuntimeConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = RuntimeConfig::default();
        config.client.timeouts.connect_ms = 0;
        config.client.timeouts.invocation_ms = -5;
        config.client.retries.connect_attempts = 0;
        config.server.bind_address = "not-an-address".into();

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.field == "client.timeouts.connect_ms"));
        assert!(errors.iter().any(|e| e.field == "server.bind_address"));
    }
}
