//! Request parsing errors.

use thiserror::Error;

/// Why a client request could not be turned into an [`HttpRequest`].
///
/// [`HttpRequest`]: super::HttpRequest
#[derive(Debug, Error)]
pub enum ParseError {
    /// The peer closed before the head terminator or the full body arrived.
    #[error("connection closed before the request was complete")]
    Incomplete,

    /// The request line or a header line violates the HTTP/1.x grammar.
    #[error("malformed request: {0}")]
    Malformed(String),

    /// Valid HTTP the proxy deliberately does not handle.
    #[error("unsupported request: {0}")]
    Unsupported(&'static str),

    /// Neither an absolute-form target nor a `Host` header names a host.
    #[error("request does not name a destination host")]
    NoHost,

    /// Head or body exceeded the configured limit.
    #[error("request {0} exceeds the configured limit")]
    TooLarge(&'static str),

    /// The client did not deliver the request in time.
    #[error("timed out waiting for the request")]
    TimedOut,

    #[error("I/O error while reading request: {0}")]
    Io(#[from] std::io::Error),
}

impl ParseError {
    /// Whether the client should still be sent a `400 Bad Request`.
    ///
    /// A peer that already went away gets nothing.
    pub fn wants_response(&self) -> bool {
        !matches!(self, ParseError::Incomplete | ParseError::Io(_))
    }
}

/// Why an upstream response head could not be read.
#[derive(Debug, Error)]
pub enum ResponseReadError {
    #[error("upstream closed before sending a complete response head")]
    Closed,

    #[error("upstream response head exceeds the configured limit")]
    TooLarge,

    #[error("timed out waiting for the upstream response")]
    TimedOut,

    #[error("malformed upstream response: {0}")]
    Malformed(String),

    #[error("I/O error while reading upstream response: {0}")]
    Io(std::io::Error),
}
