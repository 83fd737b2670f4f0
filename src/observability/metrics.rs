//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define proxy metrics (requests, bytes, latency, connections)
//! - Expose a Prometheus-compatible scrape endpoint when configured
//!
//! # Metrics
//! - `proxy_requests_total` (counter): finished transactions by outcome
//! - `proxy_bytes_sent_total` (counter): request bytes written upstream
//! - `proxy_bytes_received_total` (counter): response bytes relayed to clients
//! - `proxy_request_duration_seconds` (histogram): accept-to-close latency
//! - `proxy_active_connections` (gauge): current connection count
//!
//! # Design Decisions
//! - Updates go through the `metrics` facade; without an installed
//!   recorder they are no-ops
//! - Labels stay low-cardinality (outcome only)

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::proxy::TransactionRecord;

/// Install the Prometheus recorder with an HTTP scrape listener on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    tracing::info!(address = %addr, "Prometheus metrics endpoint listening");
    Ok(())
}

/// Update counters and the latency histogram for a finished transaction.
pub fn record_transaction(record: &TransactionRecord) {
    counter!("proxy_requests_total", "outcome" => record.outcome.as_str()).increment(1);
    counter!("proxy_bytes_sent_total").increment(record.bytes_sent);
    counter!("proxy_bytes_received_total").increment(record.bytes_received);
    histogram!("proxy_request_duration_seconds").record(record.latency().as_secs_f64());
}

pub fn set_active_connections(count: u64) {
    gauge!("proxy_active_connections").set(count as f64);
}
