//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Connection tasks produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges, histograms)
//!     → sink.rs (one TransactionRecord per connection)
//!
//! Consumers:
//!     → stdout (pretty or JSON lines)
//!     → Metrics endpoint (Prometheus scrape, optional)
//!     → CSV file (optional)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Connection ID flows through every event of a connection
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
pub mod sink;

pub use sink::{CsvSink, MemorySink, MetricsSink, NullSink};
