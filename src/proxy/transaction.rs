//! Per-connection transaction records.
//!
//! A [`TransactionBuilder`] is created when a connection is accepted and
//! filled in as the request moves through the pipeline. `finish` consumes
//! it, so every connection yields exactly one immutable [`TransactionRecord`].

use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::http::HttpRequest;
use crate::net::ConnectionId;
use crate::proxy::relay::RelayReport;

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The upstream response was relayed completely.
    Success,
    /// The filter rejected the request with a 403.
    Blocked,
    /// The request could not be read or parsed.
    ParseError,
    /// Connecting to, writing to or reading from the upstream failed.
    UpstreamError,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Blocked => "blocked",
            Outcome::ParseError => "parse_error",
            Outcome::UpstreamError => "upstream_error",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::ParseError | Outcome::UpstreamError)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything measured about one proxied request.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub connection_id: ConnectionId,
    pub client_address: SocketAddr,
    /// Unknown when the request never parsed.
    pub destination_host: Option<String>,
    pub destination_port: Option<u16>,
    pub method: Option<String>,
    /// Path and query as forwarded upstream.
    pub path: Option<String>,
    /// Final status delivered to the client; `None` for failed transactions.
    pub status_code: Option<u16>,
    /// Request bytes written to the upstream.
    pub bytes_sent: u64,
    /// Upstream response bytes written to the client, head included.
    pub bytes_received: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: Outcome,
}

impl TransactionRecord {
    /// Wall-clock time between accept and close.
    pub fn latency(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    /// Absolute URL of the request, when it parsed.
    pub fn url(&self) -> Option<String> {
        let host = self.destination_host.as_deref()?;
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host.to_string()
        };
        let path = self.path.as_deref().unwrap_or("/");
        Some(match self.destination_port {
            Some(80) | None => format!("http://{host}{path}"),
            Some(port) => format!("http://{host}:{port}{path}"),
        })
    }
}

/// Accumulates the facts of a transaction while the connection runs.
#[derive(Debug)]
pub struct TransactionBuilder {
    connection_id: ConnectionId,
    client_address: SocketAddr,
    started_at: DateTime<Utc>,
    /// Monotonic start; keeps `finished_at >= started_at` under clock steps.
    started: Instant,
    destination_host: Option<String>,
    destination_port: Option<u16>,
    method: Option<String>,
    path: Option<String>,
    status_code: Option<u16>,
    bytes_sent: u64,
    bytes_received: u64,
}

impl TransactionBuilder {
    pub fn new(connection_id: ConnectionId, client_address: SocketAddr) -> Self {
        Self {
            connection_id,
            client_address,
            started_at: Utc::now(),
            started: Instant::now(),
            destination_host: None,
            destination_port: None,
            method: None,
            path: None,
            status_code: None,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    /// Record the parsed request's identity.
    pub fn request(&mut self, request: &HttpRequest) {
        self.destination_host = Some(request.destination.host.clone());
        self.destination_port = Some(request.destination.port);
        self.method = Some(request.method.clone());
        self.path = Some(request.destination.path.clone());
    }

    /// Record what the relay measured.
    pub fn relay(&mut self, report: &RelayReport) {
        self.status_code = report.status_code;
        self.bytes_sent = report.bytes_sent;
        self.bytes_received = report.bytes_received;
    }

    /// Seal the record. Consumes the builder so it can only happen once.
    pub fn finish(self, outcome: Outcome) -> TransactionRecord {
        let elapsed = chrono::Duration::from_std(self.started.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        TransactionRecord {
            connection_id: self.connection_id,
            client_address: self.client_address,
            destination_host: self.destination_host,
            destination_port: self.destination_port,
            method: self.method,
            path: self.path,
            status_code: if outcome.is_failure() {
                None
            } else {
                self.status_code
            },
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            started_at: self.started_at,
            finished_at: self.started_at + elapsed,
            outcome,
        }
    }
}
