//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the global `tracing` subscriber
//! - Select pretty or JSON output
//! - Mirror events into the access and error log files when configured
//!
//! # Design Decisions
//! - `RUST_LOG` wins over the configured level on stdout when set
//! - Each file has its own level filter, independent of stdout
//! - JSON format for production, pretty format for development

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

use crate::config::{LogFormat, ObservabilityConfig};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Errors from installing the logging stack.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to open log file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Init(#[from] TryInitError),
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(config: &ObservabilityConfig) -> Result<(), LoggingError> {
    tracing_subscriber::registry()
        .with(build_layers(config)?)
        .try_init()?;
    Ok(())
}

fn build_layers(config: &ObservabilityConfig) -> Result<Vec<BoxedLayer>, LoggingError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_ascii_lowercase()));

    let stdout: BoxedLayer = match config.log_format {
        LogFormat::Pretty => fmt::layer().with_target(false).boxed(),
        LogFormat::Json => fmt::layer().json().with_current_span(false).boxed(),
    };
    let mut layers = vec![stdout.with_filter(filter).boxed()];

    if let Some(path) = &config.access_log {
        layers.push(file_layer(path, config.log_format)?.with_filter(LevelFilter::INFO).boxed());
    }
    // Connection failures are logged at WARN, panics at ERROR.
    if let Some(path) = &config.error_log {
        layers.push(file_layer(path, config.log_format)?.with_filter(LevelFilter::WARN).boxed());
    }
    Ok(layers)
}

fn file_layer(path: &Path, format: LogFormat) -> Result<BoxedLayer, LoggingError> {
    let writer = Mutex::new(open_append(path).map_err(|source| LoggingError::Open {
        path: path.to_path_buf(),
        source,
    })?);

    Ok(match format {
        LogFormat::Pretty => fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(writer)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(false)
            .with_writer(writer)
            .boxed(),
    })
}

fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_receive_their_levels() {
        let dir = tempfile::tempdir().unwrap();
        let config = ObservabilityConfig {
            log_level: "error".to_string(),
            access_log: Some(dir.path().join("logs/access.log")),
            error_log: Some(dir.path().join("logs/error.log")),
            ..ObservabilityConfig::default()
        };

        let subscriber = tracing_subscriber::registry().with(build_layers(&config).unwrap());
        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("debug_event");
            tracing::info!("request_forwarded");
            tracing::warn!("connection_error");
        });

        let access = std::fs::read_to_string(dir.path().join("logs/access.log")).unwrap();
        let errors = std::fs::read_to_string(dir.path().join("logs/error.log")).unwrap();
        assert!(access.contains("request_forwarded"));
        assert!(access.contains("connection_error"));
        assert!(!access.contains("debug_event"));
        assert!(errors.contains("connection_error"));
        assert!(!errors.contains("request_forwarded"));
    }

    #[test]
    fn unopenable_log_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let config = ObservabilityConfig {
            access_log: Some(blocker.join("access.log")),
            ..ObservabilityConfig::default()
        };
        assert!(matches!(build_layers(&config), Err(LoggingError::Open { .. })));
    }
}
