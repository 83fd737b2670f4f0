//! Filtering HTTP/1.1 forward proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌───────────────────────────────────────────────────┐
//!                    │                  FORWARD PROXY                    │
//!   Client Request   │  ┌─────────┐   ┌─────────┐   ┌──────────┐         │
//!   ─────────────────┼─▶│   net   │──▶│  http   │──▶│  filter  │         │
//!                    │  │listener │   │ codec   │   │  engine  │         │
//!                    │  └─────────┘   └─────────┘   └────┬─────┘         │
//!                    │                        block 403 ◀─┤ allow        │
//!                    │                                    ▼              │
//!   Client Response  │                             ┌────────────┐        │
//!   ◀────────────────┼─────────────────────────────│   relay    │◀───────┼──── Origin
//!                    │                             └─────┬──────┘        │     Server
//!                    │                                   ▼               │
//!                    │  ┌──────────────────────────────────────────────┐ │
//!                    │  │ TransactionRecord → metrics + CSV sink        │ │
//!                    │  └──────────────────────────────────────────────┘ │
//!                    └───────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;

use forward_proxy::config::{self, LogFormat, ProxyConfig};
use forward_proxy::lifecycle::{signals, startup, Shutdown};
use forward_proxy::observability::logging;

#[derive(Parser, Debug)]
#[command(name = "forward-proxy")]
#[command(version, about = "Filtering HTTP/1.1 forward proxy", long_about = None)]
struct Cli {
    /// TOML configuration file; built-in defaults apply without it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Interface to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// File with one blocked domain per line
    #[arg(long)]
    blocked_domains: Option<PathBuf>,

    /// CSV file receiving one line per transaction
    #[arg(long)]
    metrics_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// File receiving INFO and higher log events
    #[arg(long)]
    access_log: Option<PathBuf>,

    /// File receiving WARN and ERROR log events
    #[arg(long)]
    error_log: Option<PathBuf>,
}

impl Cli {
    /// Load the config file (if any) and apply command-line overrides.
    fn into_config(self) -> Result<ProxyConfig, config::ConfigError> {
        let mut config = match &self.config {
            Some(path) => config::load_config(path)?,
            None => ProxyConfig::default(),
        };

        if let Some(host) = self.host {
            config.listener.host = host;
        }
        if let Some(port) = self.port {
            config.listener.port = port;
        }
        if let Some(path) = self.blocked_domains {
            config.filter.blocked_domains_file = Some(path);
        }
        if let Some(path) = self.metrics_path {
            config.metrics.csv_path = Some(path);
        }
        if let Some(level) = self.log_level {
            config.observability.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.observability.log_format = format;
        }
        if let Some(path) = self.access_log {
            config.observability.access_log = Some(path);
        }
        if let Some(path) = self.error_log {
            config.observability.error_log = Some(path);
        }

        config::validate_config(&config).map_err(config::ConfigError::Validation)?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Cli::parse().into_config()?;

    logging::init(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "forward-proxy starting");

    tracing::info!(
        bind_address = %config.listener.bind_address(),
        max_connections = config.listener.max_connections,
        connect_timeout_secs = config.timeouts.connect_secs,
        read_timeout_secs = config.timeouts.read_secs,
        "Configuration loaded"
    );

    startup::start_exporter(&config.metrics)?;
    let context = startup::build_context(&config)?;
    let server = startup::bind_server(&config, context).await?;

    let shutdown = Shutdown::new();
    let receiver = shutdown.subscribe();
    signals::spawn_signal_handler(shutdown);

    server.run(receiver).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
