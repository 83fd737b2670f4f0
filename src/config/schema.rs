//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for the forward proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listening socket settings.
    pub listener: ListenerConfig,

    /// Domain and keyword blacklist.
    pub filter: FilterConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Head, body and relay buffer sizes.
    pub limits: LimitsConfig,

    /// Transaction record outputs.
    pub metrics: MetricsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Interface to bind (e.g., "127.0.0.1").
    pub host: String,

    /// TCP port to bind; 0 picks an ephemeral port.
    pub port: u16,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl ListenerConfig {
    /// `host:port`, bracketing IPv6 literals.
    pub fn bind_address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8888,
            max_connections: 1024,
        }
    }
}

/// Blacklist sources.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Domains blocked together with all their subdomains.
    pub blocked_domains: Vec<String>,

    /// Optional file with one blocked domain per line.
    pub blocked_domains_file: Option<PathBuf>,

    /// Case-insensitive substrings blocked in path and query.
    pub blocked_keywords: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            blocked_domains: Vec::new(),
            blocked_domains_file: None,
            blocked_keywords: vec![
                "adult".to_string(),
                "malware".to_string(),
                "phishing".to_string(),
            ],
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upstream connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Read timeout in seconds. The client head must arrive within it in
    /// full; each client body read, each upstream read and each socket
    /// write is bounded by it separately.
    pub read_secs: u64,

    /// How long in-flight connections may drain on shutdown, in seconds.
    pub shutdown_grace_secs: u64,
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn read(&self) -> Duration {
        Duration::from_secs(self.read_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 10,
            read_secs: 30,
            shutdown_grace_secs: 10,
        }
    }
}

/// Size limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest request or response head, in bytes.
    pub max_head_bytes: usize,

    /// Largest request body, in bytes.
    pub max_body_bytes: usize,

    /// Chunk size used when streaming response bodies.
    pub relay_chunk_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_head_bytes: 64 * 1024,
            max_body_bytes: 16 * 1024 * 1024,
            relay_chunk_bytes: 8 * 1024,
        }
    }
}

/// Transaction metrics outputs.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct MetricsConfig {
    /// CSV file receiving one line per transaction.
    pub csv_path: Option<PathBuf>,

    /// Prometheus scrape endpoint bind address (e.g., "127.0.0.1:9090").
    pub prometheus_address: Option<String>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}' (expected pretty or json)")),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Human-readable or JSON log lines.
    pub log_format: LogFormat,

    /// File receiving every INFO and higher event, regardless of `log_level`.
    pub access_log: Option<PathBuf>,

    /// File receiving only WARN and ERROR events.
    pub error_log: Option<PathBuf>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            access_log: None,
            error_log: None,
        }
    }
}
