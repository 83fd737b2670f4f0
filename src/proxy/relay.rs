//! Upstream forwarding.
//!
//! # Responsibilities
//! - Open a connection to the request's destination
//! - Write the normalized request, then stream the response back
//! - Answer blocked requests with a synthesized 403
//! - Measure bytes and status for the transaction record
//!
//! # Design Decisions
//! - One upstream connection per request, always `Connection: close`
//! - The response head is fully buffered before anything reaches the client
//! - Bodies are streamed in bounded chunks and never buffered whole
//! - Nothing is synthesized once upstream bytes were relayed; failures close
//! - Every read and write on either socket is bounded by the read timeout

use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;

use crate::config::ProxyConfig;
use crate::filter::BlockReason;
use crate::http::{
    read_response_head, write_with_timeout, Destination, HttpRequest, HttpResponse, ResponseBody,
    ResponseReadError,
};

/// Why relaying a request failed.
#[derive(Debug, Error)]
pub enum RelayError {
    /// DNS failure, refused connection or connect timeout.
    #[error("upstream {authority} unreachable: {reason}")]
    UpstreamUnreachable { authority: String, reason: String },

    /// A read from or write to the upstream exceeded the read timeout.
    #[error("upstream timed out")]
    UpstreamTimeout,

    /// The upstream closed or reset before the response was complete.
    #[error("upstream connection lost: {0}")]
    UpstreamReset(String),

    /// The upstream sent something that is not an HTTP/1.x response.
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),

    /// Writing to the client failed or the client stopped reading.
    #[error("client connection lost: {0}")]
    ClientGone(std::io::Error),
}

impl RelayError {
    fn from_upstream_io(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => RelayError::UpstreamTimeout,
            _ => RelayError::UpstreamReset(e.to_string()),
        }
    }
}

impl From<ResponseReadError> for RelayError {
    fn from(e: ResponseReadError) -> Self {
        match e {
            ResponseReadError::Closed => {
                RelayError::UpstreamReset("closed before sending a response".into())
            }
            ResponseReadError::TooLarge => {
                RelayError::InvalidResponse("response head too large".into())
            }
            ResponseReadError::TimedOut => RelayError::UpstreamTimeout,
            ResponseReadError::Malformed(reason) => RelayError::InvalidResponse(reason),
            ResponseReadError::Io(e) => RelayError::from_upstream_io(e),
        }
    }
}

/// What a relay attempt did, successful or not.
#[derive(Debug)]
pub struct RelayReport {
    /// Status of the final head written to the client.
    pub status_code: Option<u16>,
    /// Request bytes written upstream.
    pub bytes_sent: u64,
    /// Upstream bytes written to the client, heads included.
    pub bytes_received: u64,
    pub result: Result<(), RelayError>,
}

impl RelayReport {
    fn empty() -> Self {
        Self {
            status_code: None,
            bytes_sent: 0,
            bytes_received: 0,
            result: Ok(()),
        }
    }

    fn fail(mut self, error: RelayError) -> Self {
        self.result = Err(error);
        self
    }
}

/// Forwards requests to their origin servers.
#[derive(Debug, Clone)]
pub struct Relay {
    connect_timeout: Duration,
    read_timeout: Duration,
    chunk_size: usize,
    max_head_bytes: usize,
}

impl Relay {
    pub fn new(
        connect_timeout: Duration,
        read_timeout: Duration,
        chunk_size: usize,
        max_head_bytes: usize,
    ) -> Self {
        Self {
            connect_timeout,
            read_timeout,
            chunk_size: chunk_size.max(1),
            max_head_bytes,
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(
            config.timeouts.connect(),
            config.timeouts.read(),
            config.limits.relay_chunk_bytes,
            config.limits.max_head_bytes,
        )
    }

    /// Forward `request` to its destination and stream the response to `client`.
    pub async fn forward<C>(&self, client: &mut C, request: &HttpRequest) -> RelayReport
    where
        C: AsyncWrite + Unpin,
    {
        let mut report = RelayReport::empty();

        let mut upstream = match self.connect(&request.destination).await {
            Ok(stream) => stream,
            Err(e) => return report.fail(e),
        };

        let payload = request.serialize();
        if let Err(e) = write_with_timeout(&mut upstream, &payload, Some(self.read_timeout)).await {
            return report.fail(RelayError::from_upstream_io(e));
        }
        report.bytes_sent = payload.len() as u64;

        let mut buf = Vec::with_capacity(4096);
        let head = loop {
            let (head, head_len) = match read_response_head(
                &mut upstream,
                &mut buf,
                self.max_head_bytes,
                Some(self.read_timeout),
            )
            .await
            {
                Ok(parsed) => parsed,
                Err(e) => return report.fail(e.into()),
            };

            if !head.is_interim() {
                buf.drain(..head_len);
                break head;
            }

            // 1xx heads go through untouched; the final head follows.
            if let Err(e) = self.write_client(client, &buf[..head_len]).await {
                return report.fail(RelayError::ClientGone(e));
            }
            report.bytes_received += head_len as u64;
            buf.drain(..head_len);
            tracing::trace!(status = head.status_code, "Interim response relayed");
        };

        let head_bytes = head.to_bytes();
        if let Err(e) = self.write_client(client, &head_bytes).await {
            return report.fail(RelayError::ClientGone(e));
        }
        report.status_code = Some(head.status_code);
        report.bytes_received += head_bytes.len() as u64;

        let framing = head.framing(&request.method);
        let mut body = ResponseBody::new(
            &mut upstream,
            framing,
            buf,
            self.chunk_size,
            Some(self.read_timeout),
        );
        loop {
            match body.next_chunk().await {
                Ok(Some(chunk)) => {
                    if let Err(e) = self.write_client(client, chunk).await {
                        return report.fail(RelayError::ClientGone(e));
                    }
                    report.bytes_received += chunk.len() as u64;
                }
                Ok(None) => break,
                Err(e) => return report.fail(RelayError::from_upstream_io(e)),
            }
        }
        report
    }

    /// Answer a blocked request with a 403 naming the reason.
    ///
    /// Nothing is sent upstream, so both byte counters stay at zero.
    pub async fn reject<C>(&self, client: &mut C, host: &str, reason: &BlockReason) -> RelayReport
    where
        C: AsyncWrite + Unpin,
    {
        let mut report = RelayReport::empty();
        report.status_code = Some(403);

        let response = HttpResponse::forbidden(host, reason).to_bytes();
        if let Err(e) = self.write_client(client, &response).await {
            return report.fail(RelayError::ClientGone(e));
        }
        report
    }

    async fn write_client<C>(&self, client: &mut C, data: &[u8]) -> std::io::Result<()>
    where
        C: AsyncWrite + Unpin,
    {
        write_with_timeout(client, data, Some(self.read_timeout)).await
    }

    async fn connect(&self, destination: &Destination) -> Result<TcpStream, RelayError> {
        let unreachable = |reason: String| RelayError::UpstreamUnreachable {
            authority: destination.authority(),
            reason,
        };

        let connect = TcpStream::connect((destination.host.as_str(), destination.port));
        let stream = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(unreachable(e.to_string())),
            Err(_) => {
                return Err(unreachable(format!(
                    "connect timed out after {:?}",
                    self.connect_timeout
                )))
            }
        };
        let _ = stream.set_nodelay(true);

        tracing::debug!(
            upstream = %destination.authority(),
            "Upstream connected"
        );
        Ok(stream)
    }
}
