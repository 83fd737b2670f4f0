//! Response heads, streamed response bodies and proxy-generated responses.
//!
//! # Responsibilities
//! - Parse the upstream status line and headers
//! - Decide how the body is delimited (length, none, until close)
//! - Hand out the body as a bounded sequence of chunks
//! - Build the 400 / 403 responses the proxy answers with itself
//!
//! # Design Decisions
//! - The head is buffered in full before anything reaches the client
//! - The body is never buffered in full; chunked bodies pass through
//!   undecoded and end when the upstream closes

use std::time::Duration;
use tokio::io::AsyncRead;

use super::{
    collect_headers, get_header, has_header, is_connection_header, read_head, read_with_timeout,
    write_headers, HeadReadError, Header, ResponseReadError, Version, MAX_HEADERS,
};

/// Status line and headers of an upstream response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status_code: u16,
    /// Reason phrase bytes; may carry obs-text.
    pub reason: Vec<u8>,
    /// Headers in wire order, original casing, duplicates kept.
    pub headers: Vec<Header>,
}

/// How the end of a response body is recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the head.
    Empty,
    /// Exactly this many bytes follow.
    Length(u64),
    /// Everything until the upstream closes the connection.
    UntilClose,
}

impl ResponseHead {
    /// Parse a response head.
    ///
    /// Returns `Ok(None)` while the head is still incomplete, otherwise the
    /// head and its length in bytes.
    pub fn parse(data: &[u8]) -> Result<Option<(Self, usize)>, String> {
        let mut header_buf = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut res = httparse::Response::new(&mut header_buf);

        let head_len = match res.parse(data) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(e.to_string()),
        };

        let version = res
            .version
            .and_then(|minor| match minor {
                0 => Some(Version::Http10),
                1 => Some(Version::Http11),
                _ => None,
            })
            .ok_or_else(|| "unsupported HTTP version".to_string())?;
        let status_code = res.code.ok_or_else(|| "missing status code".to_string())?;
        let reason = reason_bytes(data, head_len);
        let headers = collect_headers(res.headers);

        Ok(Some((
            Self {
                version,
                status_code,
                reason,
                headers,
            },
            head_len,
        )))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        get_header(&self.headers, name)
    }

    /// Informational responses that precede the final one.
    ///
    /// `101 Switching Protocols` is final: the connection changes hands.
    pub fn is_interim(&self) -> bool {
        (100..200).contains(&self.status_code) && self.status_code != 101
    }

    /// Body delimitation for this response to a request with `request_method`.
    pub fn framing(&self, request_method: &str) -> BodyFraming {
        if request_method.eq_ignore_ascii_case("HEAD")
            || self.is_interim()
            || self.status_code == 204
            || self.status_code == 304
        {
            return BodyFraming::Empty;
        }
        if has_header(&self.headers, "transfer-encoding") {
            return BodyFraming::UntilClose;
        }
        match self
            .header("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            Some(len) => BodyFraming::Length(len),
            None => BodyFraming::UntilClose,
        }
    }

    /// Serialize the head for the client with `Connection: close` enforced.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(format!("{} {} ", self.version, self.status_code).as_bytes());
        out.extend_from_slice(&self.reason);
        out.extend_from_slice(b"\r\n");
        write_headers(
            &mut out,
            self.headers.iter().filter(|(name, _)| !is_connection_header(name)),
        );
        out.extend_from_slice(b"Connection: close\r\n\r\n");
        out
    }
}

/// The reason phrase as raw bytes.
///
/// `httparse` drops reasons that are not UTF-8, so they are taken from the
/// status line directly.
fn reason_bytes(data: &[u8], head_len: usize) -> Vec<u8> {
    let line_end = data[..head_len]
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(head_len);
    // "HTTP/1.x" SP status-code SP reason
    data[..line_end]
        .splitn(3, |&b| b == b' ')
        .nth(2)
        .map(|r| r.to_vec())
        .unwrap_or_default()
}

/// Read a response head from the upstream.
///
/// Returns the head, its length, and leaves any body bytes that arrived with
/// it in `buf` after the head.
pub async fn read_response_head<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_head_bytes: usize,
    read_timeout: Option<Duration>,
) -> Result<(ResponseHead, usize), ResponseReadError>
where
    R: AsyncRead + Unpin,
{
    let head_len = read_head(reader, buf, max_head_bytes, read_timeout)
        .await
        .map_err(|e| match e {
            HeadReadError::Closed => ResponseReadError::Closed,
            HeadReadError::TooLarge => ResponseReadError::TooLarge,
            HeadReadError::TimedOut => ResponseReadError::TimedOut,
            HeadReadError::Io(e) => ResponseReadError::Io(e),
        })?;

    match ResponseHead::parse(&buf[..head_len]) {
        Ok(Some((head, len))) => Ok((head, len)),
        Ok(None) => Err(ResponseReadError::Malformed("truncated response head".into())),
        Err(e) => Err(ResponseReadError::Malformed(e)),
    }
}

/// A response body read lazily from the upstream, one chunk at a time.
///
/// Finite and not restartable: once a chunk is handed out it is gone.
pub struct ResponseBody<'r, R> {
    reader: &'r mut R,
    /// Body bytes that arrived together with the head.
    prefix: Vec<u8>,
    /// Bytes still expected; `None` reads until the upstream closes.
    remaining: Option<u64>,
    buf: Vec<u8>,
    chunk_size: usize,
    read_timeout: Option<Duration>,
    done: bool,
}

impl<'r, R> ResponseBody<'r, R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(
        reader: &'r mut R,
        framing: BodyFraming,
        prefix: Vec<u8>,
        chunk_size: usize,
        read_timeout: Option<Duration>,
    ) -> Self {
        let remaining = match framing {
            BodyFraming::Empty => Some(0),
            BodyFraming::Length(len) => Some(len),
            BodyFraming::UntilClose => None,
        };
        Self {
            reader,
            prefix,
            remaining,
            buf: Vec::with_capacity(chunk_size),
            chunk_size: chunk_size.max(1),
            read_timeout,
            done: false,
        }
    }

    /// The next chunk of the body, or `None` once it is complete.
    ///
    /// A declared length cut short by the upstream closing yields an
    /// `UnexpectedEof` error; each read times out with `TimedOut`.
    pub async fn next_chunk(&mut self) -> std::io::Result<Option<&[u8]>> {
        if self.done {
            return Ok(None);
        }
        if self.remaining == Some(0) {
            self.done = true;
            return Ok(None);
        }

        if !self.prefix.is_empty() {
            let mut chunk = std::mem::take(&mut self.prefix);
            if let Some(remaining) = self.remaining.as_mut() {
                chunk.truncate(usize::try_from(*remaining).unwrap_or(usize::MAX));
                *remaining -= chunk.len() as u64;
            }
            self.buf = chunk;
            return Ok(Some(&self.buf));
        }

        let want = match self.remaining {
            Some(remaining) => usize::try_from(remaining)
                .unwrap_or(usize::MAX)
                .min(self.chunk_size),
            None => self.chunk_size,
        };
        self.buf.resize(self.chunk_size, 0);

        let n = read_with_timeout(&mut *self.reader, &mut self.buf[..want], self.read_timeout).await?;
        if n == 0 {
            self.done = true;
            return match self.remaining {
                Some(remaining) if remaining > 0 => Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("upstream closed with {remaining} body bytes outstanding"),
                )),
                _ => Ok(None),
            };
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= n as u64;
        }
        Ok(Some(&self.buf[..n]))
    }
}

/// A response generated by the proxy itself.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub reason: &'static str,
    pub body: String,
}

impl HttpResponse {
    /// `403 Forbidden` naming what blocked the request.
    pub fn forbidden(host: &str, reason: impl std::fmt::Display) -> Self {
        Self {
            status_code: 403,
            reason: "Forbidden",
            body: format!("Access to {host} is blocked by proxy policy: {reason}.\n"),
        }
    }

    /// `400 Bad Request` for requests that could not be parsed.
    pub fn bad_request() -> Self {
        Self {
            status_code: 400,
            reason: "Bad Request",
            body: "Malformed request received by proxy.\n".to_string(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.status_code,
            self.reason,
            self.body.len(),
            self.body
        )
        .into_bytes()
    }
}
