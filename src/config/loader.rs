//! Configuration loading from disk.

use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::config::schema::SettlementConfig;
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
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<SettlementConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<SettlementConfig, ConfigError> {
    let config: SettlementConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Resolve the configuration for a process.
///
/// An explicit path must exist. Without one, `settlement.toml` in the working
/// directory is used if present, otherwise validated defaults.
pub fn resolve_config(explicit: Option<&Path>) -> Result<SettlementConfig, ConfigError> {
    if let Some(path) = explicit {
        return load_config(path);
    }

    let fallback = Path::new("settlement.toml");
    if fallback.exists() {
        return load_config(fallback);
    }

    tracing::info!("No configuration file found, using defaults");
    let config = SettlementConfig::default();
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid() {
        let config = parse_config(
            r#"
            [queue]
            poll_interval_secs = 5
            max_backoff_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.queue.poll_interval_secs, 5);
    }

    #[test]
    fn test_parse_invalid_values() {
        let err = parse_config(
            r#"
            [queue]
            poll_interval_secs = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("queue.poll_interval_secs"));
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = parse_config(include_str!("../../settlement.example.toml")).unwrap();
        assert!(config.blockchain.enabled);
        assert_eq!(config.blockchain.chain_id, 31337);
        assert_eq!(config.claims.rate_limit_per_window, 5);
    }

    #[test]
    fn test_parse_syntax_error() {
        let err = parse_config("[queue\npoll_interval_secs = 5").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_explicit_missing_file() {
        let err = resolve_config(Some(Path::new("/nonexistent/settlement.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
