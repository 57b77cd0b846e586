//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::RuntimeConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse and validate configuration from a TOML string.
pub fn parse_config(content: &str) -> Result<RuntimeConfig, ConfigError> {
    let config: RuntimeConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<RuntimeConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid() {
        let config = parse_config("[client.timeouts]\ninvocation_ms = 100\n").unwrap();
        assert_eq!(config.client.timeouts.invocation_ms, 100);
    }

    #[test]
    fn test_validation_error_message() {
        let err = parse_config("[client.timeouts]\nidle_ms = 0\n").unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("Validation failed"));
        assert!(msg.contains("client.timeouts.idle_ms"));
    }

    #[test]
    fn test_missing_file() {
        let err = load_config(Path::new("/nonexistent/rpc-deadlines.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
