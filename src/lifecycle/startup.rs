//! Startup orchestration.
//!
//! # Responsibilities
//! - Build the filter from inline rules and the blocklist file
//! - Start the Prometheus exporter when configured
//! - Open the transaction sink
//! - Assemble the shared connection context
//! - Bind the listener last (traffic only when ready)
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{ConfigError, FilterConfig, MetricsConfig, ProxyConfig, ValidationError};
use crate::filter::{load_domains, BlocklistError, FilterEngine};
use crate::http::Limits;
use crate::net::{Listener, ListenerError};
use crate::observability::{metrics, CsvSink, MetricsSink, NullSink};
use crate::proxy::{ProxyContext, ProxyServer, Relay};

/// Error type for startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Blocklist(#[from] BlocklistError),

    #[error("failed to open metrics file {path}: {source}")]
    Sink {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start metrics exporter: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// Compile the blacklist from inline entries plus the optional domain file.
///
/// A configured file that cannot be read is an error.
pub fn build_filter(config: &FilterConfig) -> Result<FilterEngine, StartupError> {
    let mut domains = config.blocked_domains.clone();
    if let Some(path) = &config.blocked_domains_file {
        domains.extend(load_domains(path)?);
    }

    let filter = FilterEngine::new(&domains, &config.blocked_keywords);
    tracing::info!(
        domains = filter.domain_count(),
        keywords = filter.keyword_count(),
        "Filter initialized"
    );
    Ok(filter)
}

/// Install the Prometheus recorder and scrape endpoint, if an address is set.
///
/// Returns the address it listens on. Must run inside the Tokio runtime.
pub fn start_exporter(config: &MetricsConfig) -> Result<Option<SocketAddr>, StartupError> {
    let Some(address) = &config.prometheus_address else {
        return Ok(None);
    };
    let address: SocketAddr = address.parse().map_err(|_| {
        ConfigError::Validation(vec![ValidationError::InvalidMetricsAddress(address.clone())])
    })?;
    metrics::init_metrics(address)?;
    Ok(Some(address))
}

/// Open the CSV sink when a path is configured, otherwise discard records.
pub fn build_sink(config: &MetricsConfig) -> Result<Arc<dyn MetricsSink>, StartupError> {
    match &config.csv_path {
        Some(path) => {
            let sink = CsvSink::open(path).map_err(|source| StartupError::Sink {
                path: path.clone(),
                source,
            })?;
            Ok(Arc::new(sink))
        }
        None => Ok(Arc::new(NullSink)),
    }
}

/// Wire config → filter → relay → sink into the shared connection context.
pub fn build_context(config: &ProxyConfig) -> Result<Arc<ProxyContext>, StartupError> {
    let sink = build_sink(&config.metrics)?;
    build_context_with_sink(config, sink)
}

/// Like [`build_context`] with a caller-provided sink.
pub fn build_context_with_sink(
    config: &ProxyConfig,
    sink: Arc<dyn MetricsSink>,
) -> Result<Arc<ProxyContext>, StartupError> {
    let filter = build_filter(&config.filter)?;
    Ok(Arc::new(ProxyContext {
        filter: Arc::new(filter),
        relay: Relay::from_config(config),
        sink,
        limits: Limits {
            max_head_bytes: config.limits.max_head_bytes,
            max_body_bytes: config.limits.max_body_bytes,
        },
        read_timeout: config.timeouts.read(),
    }))
}

/// Bind the listener and build the server around `context`.
pub async fn bind_server(
    config: &ProxyConfig,
    context: Arc<ProxyContext>,
) -> Result<ProxyServer, StartupError> {
    let listener = Listener::bind(&config.listener).await?;
    Ok(ProxyServer::new(
        listener,
        context,
        config.timeouts.shutdown_grace(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn filter_merges_inline_and_file_domains() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# blocked\nfile.test").unwrap();

        let config = FilterConfig {
            blocked_domains: vec!["inline.test".into()],
            blocked_domains_file: Some(file.path().to_path_buf()),
            blocked_keywords: vec![],
        };
        let filter = build_filter(&config).unwrap();
        assert!(filter.evaluate("a.file.test", "/").is_blocked());
        assert!(filter.evaluate("inline.test", "/").is_blocked());
        assert_eq!(filter.keyword_count(), 0);
    }

    #[test]
    fn missing_blocklist_file_fails_startup() {
        let config = FilterConfig {
            blocked_domains_file: Some("/nonexistent/blocklist.txt".into()),
            ..FilterConfig::default()
        };
        assert!(matches!(
            build_filter(&config),
            Err(StartupError::Blocklist(_))
        ));
    }

    #[test]
    fn exporter_is_optional() {
        assert_eq!(start_exporter(&MetricsConfig::default()).unwrap(), None);
    }

    #[test]
    fn exporter_rejects_bad_address() {
        let config = MetricsConfig {
            prometheus_address: Some("not-an-address".into()),
            ..MetricsConfig::default()
        };
        assert!(matches!(
            start_exporter(&config),
            Err(StartupError::Config(ConfigError::Validation(_)))
        ));
    }

    #[test]
    fn context_reflects_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ProxyConfig::default();
        config.metrics.csv_path = Some(dir.path().join("metrics.csv"));
        config.limits.max_body_bytes = 1234;

        let context = build_context(&config).unwrap();
        assert_eq!(context.limits.max_body_bytes, 1234);
        assert_eq!(context.read_timeout, config.timeouts.read());
        assert!(dir.path().join("metrics.csv").exists());
    }
}
