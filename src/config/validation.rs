//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, buffer sizes sane)
//! - Validate addresses that must parse before startup
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;
use thiserror::Error;

use crate::config::schema::ProxyConfig;

/// Smallest head limit that still fits a realistic request line and headers.
const MIN_HEAD_BYTES: usize = 1024;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener.host must not be empty")]
    EmptyHost,

    #[error("listener.max_connections must be greater than zero")]
    ZeroMaxConnections,

    #[error("timeouts.{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("limits.max_head_bytes must be at least 1024 (got {0})")]
    HeadLimitTooSmall(usize),

    #[error("limits.relay_chunk_bytes must be greater than zero")]
    ZeroChunkSize,

    #[error("metrics.prometheus_address '{0}' is not a socket address")]
    InvalidMetricsAddress(String),

    #[error("log level '{0}' is not one of trace, debug, info, warn, error")]
    InvalidLogLevel(String),
}

/// Check a parsed configuration, collecting every problem.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.host.trim().is_empty() {
        errors.push(ValidationError::EmptyHost);
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::ZeroMaxConnections);
    }

    if config.timeouts.connect_secs == 0 {
        errors.push(ValidationError::ZeroTimeout("connect_secs"));
    }
    if config.timeouts.read_secs == 0 {
        errors.push(ValidationError::ZeroTimeout("read_secs"));
    }

    if config.limits.max_head_bytes < MIN_HEAD_BYTES {
        errors.push(ValidationError::HeadLimitTooSmall(config.limits.max_head_bytes));
    }
    if config.limits.relay_chunk_bytes == 0 {
        errors.push(ValidationError::ZeroChunkSize);
    }

    if let Some(addr) = &config.metrics.prometheus_address {
        if addr.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::InvalidMetricsAddress(addr.clone()));
        }
    }

    let level = config.observability.log_level.to_ascii_lowercase();
    if !matches!(level.as_str(), "trace" | "debug" | "info" | "warn" | "error") {
        errors.push(ValidationError::InvalidLogLevel(
            config.observability.log_level.clone(),
        ));
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
    fn defaults_are_valid() {
        assert_eq!(validate_config(&ProxyConfig::default()), Ok(()));
    }

    #[test]
    fn reports_every_problem() {
        let mut config = ProxyConfig::default();
        config.listener.host = " ".to_string();
        config.timeouts.connect_secs = 0;
        config.timeouts.read_secs = 0;
        config.limits.max_head_bytes = 10;
        config.limits.relay_chunk_bytes = 0;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![
                ValidationError::EmptyHost,
                ValidationError::ZeroTimeout("connect_secs"),
                ValidationError::ZeroTimeout("read_secs"),
                ValidationError::HeadLimitTooSmall(10),
                ValidationError::ZeroChunkSize,
            ]
        );
    }

    #[test]
    fn rejects_bad_metrics_address_and_level() {
        let mut config = ProxyConfig::default();
        config.metrics.prometheus_address = Some("not-an-address".to_string());
        config.observability.log_level = "loud".to_string();

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[1].to_string().contains("loud"));
    }

    #[test]
    fn port_zero_is_allowed_for_ephemeral_binds() {
        let mut config = ProxyConfig::default();
        config.listener.port = 0;
        assert!(validate_config(&config).is_ok());
    }
}
