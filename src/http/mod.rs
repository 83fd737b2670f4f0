//! HTTP/1.x message codec.
//!
//! # Data Flow
//! ```text
//! client socket
//!     → read_head (buffer until CRLF CRLF)
//!     → request.rs (request line, headers, destination, body)
//!     → HttpRequest::serialize (origin-form, Connection: close)
//!     → upstream socket
//!
//! upstream socket
//!     → read_head
//!     → response.rs (status line, headers, framing)
//!     → ResponseHead::to_bytes + ResponseBody chunks
//!     → client socket
//! ```
//!
//! # Design Decisions
//! - Heads are parsed with `httparse`; bodies are never parsed
//! - Request bodies are small and buffered, response bodies are streamed
//! - Chunked request bodies are rejected instead of decoded

pub mod error;
pub mod request;
pub mod response;

pub use error::{ParseError, ResponseReadError};
pub use request::{read_request, Destination, HttpRequest, Version};
pub use response::{read_response_head, BodyFraming, HttpResponse, ResponseBody, ResponseHead};

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum number of headers accepted in a single head.
pub const MAX_HEADERS: usize = 100;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Size and framing limits applied while reading requests.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Largest request or response head accepted, in bytes.
    pub max_head_bytes: usize,
    /// Largest request body accepted, in bytes.
    pub max_body_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_head_bytes: 64 * 1024,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

/// A header as received: name and raw value bytes.
///
/// Values may carry obs-text (bytes above 0x7f), so they are kept as bytes
/// and written back unchanged.
pub type Header = (String, Vec<u8>);

/// Case-insensitive lookup of the first header with the given name.
///
/// Returns `None` when the value is not UTF-8; use [`has_header`] for
/// presence checks.
pub fn get_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .and_then(|(_, v)| std::str::from_utf8(v).ok())
}

/// Whether any header with the given name is present, whatever its value.
pub fn has_header(headers: &[Header], name: &str) -> bool {
    headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
}

/// Locate the end of the head, returning the offset just past CRLF CRLF.
pub fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
        .map(|pos| pos + HEAD_TERMINATOR.len())
}

/// Failure modes while buffering a head off the wire.
#[derive(Debug)]
pub(crate) enum HeadReadError {
    /// Peer closed before the terminator arrived.
    Closed,
    /// Head grew past the configured limit.
    TooLarge,
    /// A single read exceeded the per-read timeout.
    TimedOut,
    Io(std::io::Error),
}

/// Read from `reader` into `buf` until a full head is buffered.
///
/// Returns the head length; bytes past it (the start of the body) stay in
/// `buf`. `read_timeout` bounds every individual read when set.
pub(crate) async fn read_head<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_head_bytes: usize,
    read_timeout: Option<Duration>,
) -> Result<usize, HeadReadError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    let mut scanned = 0usize;

    loop {
        // Only rescan the tail that could complete a terminator.
        let from = scanned.saturating_sub(HEAD_TERMINATOR.len() - 1);
        if let Some(end) = find_head_end(&buf[from..]) {
            return Ok(from + end);
        }
        scanned = buf.len();

        if buf.len() > max_head_bytes {
            return Err(HeadReadError::TooLarge);
        }

        let n = read_with_timeout(reader, &mut chunk, read_timeout)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::TimedOut => HeadReadError::TimedOut,
                _ => HeadReadError::Io(e),
            })?;
        if n == 0 {
            return Err(HeadReadError::Closed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// A single read, optionally bounded by a timeout.
///
/// Timeouts surface as `ErrorKind::TimedOut` so callers can map them
/// separately from resets.
pub(crate) async fn read_with_timeout<R>(
    reader: &mut R,
    buf: &mut [u8],
    read_timeout: Option<Duration>,
) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    bounded(read_timeout, reader.read(buf), "read timed out").await
}

/// Write all of `data` and flush.
///
/// `write_timeout` bounds each individual write, so a peer that keeps
/// draining is never cut off but one that stops reading surfaces as
/// `ErrorKind::TimedOut` instead of holding the task forever.
pub(crate) async fn write_with_timeout<W>(
    writer: &mut W,
    data: &[u8],
    write_timeout: Option<Duration>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while written < data.len() {
        let n = bounded(write_timeout, writer.write(&data[written..]), "write timed out").await?;
        if n == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        written += n;
    }
    bounded(write_timeout, writer.flush(), "write timed out").await
}

async fn bounded<F, T>(limit: Option<Duration>, io: F, message: &'static str) -> std::io::Result<T>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, io)
            .await
            .unwrap_or_else(|_| Err(std::io::Error::new(std::io::ErrorKind::TimedOut, message))),
        None => io.await,
    }
}

/// Serialize a header list as `name: value\r\n` lines.
fn write_headers<'a>(out: &mut Vec<u8>, headers: impl IntoIterator<Item = &'a Header>) {
    for (name, value) in headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }
}

/// True for headers that never travel past the proxy.
///
/// Only the connection-management headers are rewritten; everything else
/// is forwarded as received.
fn is_connection_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("connection") || name.eq_ignore_ascii_case("proxy-connection")
}

/// Copy `httparse` headers into an owned, ordered list.
///
/// Names are tokens and always ASCII; values keep their bytes.
fn collect_headers(headers: &[httparse::Header<'_>]) -> Vec<Header> {
    headers
        .iter()
        .map(|h| (h.name.to_string(), h.value.trim_ascii().to_vec()))
        .collect()
}
