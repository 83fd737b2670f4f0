//! Transaction record consumers.
//!
//! # Responsibilities
//! - Accept exactly one [`TransactionRecord`] per connection
//! - Persist records as CSV lines for offline analysis
//! - Keep records in memory for tests and embedding
//!
//! # Design Decisions
//! - `record` is synchronous and infallible from the caller's view
//! - Sink failures are logged, never propagated into the connection
//! - The CSV sink writes whole lines under a lock so lines never interleave

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::SecondsFormat;

use crate::proxy::TransactionRecord;

/// Destination for finished transaction records.
pub trait MetricsSink: Send + Sync {
    fn record(&self, record: TransactionRecord);
}

/// Discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn record(&self, _record: TransactionRecord) {}
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<TransactionRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record received so far, in arrival order.
    pub fn records(&self) -> Vec<TransactionRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self.records.lock() {
            Ok(records) => records.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetricsSink for MemorySink {
    fn record(&self, record: TransactionRecord) {
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}

pub const CSV_HEADER: &str = "timestamp,connection_id,client_ip,method,url,host,port,status,outcome,blocked,latency_ms,request_bytes,response_bytes";

/// Appends one CSV line per record to a file.
#[derive(Debug)]
pub struct CsvSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl CsvSink {
    /// Open `path` for appending, writing the header when the file is new or empty.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        if writer.get_ref().metadata()?.len() == 0 {
            writeln!(writer, "{CSV_HEADER}")?;
            writer.flush()?;
        }

        tracing::info!(path = %path.display(), "Transaction CSV opened");
        Ok(Self {
            path,
            writer: Mutex::new(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        let mut writer = match self.writer.lock() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        };
        writer.write_all(line.as_bytes())?;
        writer.flush()
    }
}

impl MetricsSink for CsvSink {
    fn record(&self, record: TransactionRecord) {
        let line = csv_line(&record);
        if let Err(e) = self.append(&line) {
            tracing::error!(
                path = %self.path.display(),
                error = %e,
                connection_id = %record.connection_id,
                "Failed to write transaction record"
            );
        }
    }
}

/// Render a record as one newline-terminated CSV line matching [`CSV_HEADER`].
pub fn csv_line(record: &TransactionRecord) -> String {
    let fields = [
        record
            .started_at
            .to_rfc3339_opts(SecondsFormat::Millis, true),
        record.connection_id.as_u64().to_string(),
        record.client_address.ip().to_string(),
        record.method.clone().unwrap_or_default(),
        record.url().unwrap_or_default(),
        record.destination_host.clone().unwrap_or_default(),
        record
            .destination_port
            .map(|p| p.to_string())
            .unwrap_or_default(),
        record
            .status_code
            .map(|s| s.to_string())
            .unwrap_or_default(),
        record.outcome.as_str().to_string(),
        (record.outcome == crate::proxy::Outcome::Blocked).to_string(),
        format!("{:.3}", record.latency().as_secs_f64() * 1000.0),
        record.bytes_sent.to_string(),
        record.bytes_received.to_string(),
    ];

    let mut line = fields
        .iter()
        .map(|f| escape(f))
        .collect::<Vec<_>>()
        .join(",");
    line.push('\n');
    line
}

fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ConnectionId;
    use crate::proxy::{Outcome, TransactionBuilder};

    fn record(outcome: Outcome) -> TransactionRecord {
        TransactionBuilder::new(ConnectionId::new(), "10.0.0.7:40000".parse().unwrap())
            .finish(outcome)
    }

    #[test]
    fn escapes_special_characters() {
        assert_eq!(escape("plain"), "plain");
        assert_eq!(escape("a,b"), "\"a,b\"");
        assert_eq!(escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn csv_line_matches_header_columns() {
        let mut record = record(Outcome::Blocked);
        record.destination_host = Some("ads.example.com".into());
        record.destination_port = Some(80);
        record.method = Some("GET".into());
        record.path = Some("/a,b".into());
        record.status_code = Some(403);

        let line = csv_line(&record);
        assert!(line.ends_with('\n'));
        assert!(line.contains(",10.0.0.7,GET,\"http://ads.example.com/a,b\",ads.example.com,80,403,blocked,true,"));
        assert!(line.trim_end().ends_with(",0,0"));
    }

    #[test]
    fn csv_sink_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("metrics.csv");

        let sink = CsvSink::open(&path).unwrap();
        sink.record(record(Outcome::ParseError));
        drop(sink);

        let sink = CsvSink::open(&path).unwrap();
        sink.record(record(Outcome::UpstreamError));
        drop(sink);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        assert!(lines[1].contains(",parse_error,false,"));
        assert!(lines[2].contains(",upstream_error,false,"));
    }

    #[test]
    fn memory_sink_keeps_order() {
        let sink = MemorySink::new();
        assert!(sink.is_empty());
        sink.record(record(Outcome::Success));
        sink.record(record(Outcome::Blocked));

        let outcomes: Vec<Outcome> = sink.records().iter().map(|r| r.outcome).collect();
        assert_eq!(outcomes, vec![Outcome::Success, Outcome::Blocked]);
    }
}
