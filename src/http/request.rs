//! Request parsing, destination resolution and re-serialization.
//!
//! # Responsibilities
//! - Parse the request line and headers of a client request
//! - Resolve the destination from an absolute-form target or `Host`
//! - Read a `Content-Length` body, reject chunked bodies
//! - Rebuild an origin-form request for the upstream server

use std::time::Duration;
use tokio::io::AsyncRead;

use super::{
    collect_headers, find_head_end, get_header, has_header, is_connection_header, read_head,
    read_with_timeout, write_headers, HeadReadError, Header, Limits, ParseError, MAX_HEADERS,
};

const DEFAULT_HTTP_PORT: u16 = 80;

/// HTTP protocol versions accepted from clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    fn from_minor(minor: u8) -> Option<Self> {
        match minor {
            0 => Some(Version::Http10),
            1 => Some(Version::Http11),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a request is going: the upstream socket address and origin-form path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Host name or IP literal (IPv6 without brackets).
    pub host: String,
    pub port: u16,
    /// Path plus query, always starting with `/` (or `*` for `OPTIONS *`).
    pub path: String,
}

impl Destination {
    /// `host[:port]` as it belongs in a `Host` header.
    pub fn authority(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == DEFAULT_HTTP_PORT {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

/// A fully parsed client request.
///
/// Built only from a complete, well-formed head; never partially populated.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Method token exactly as sent.
    pub method: String,
    /// Request target exactly as sent.
    pub target: String,
    pub version: Version,
    /// Headers in wire order, original casing, duplicates kept.
    pub headers: Vec<Header>,
    /// Present only when `Content-Length` is greater than zero.
    pub body: Option<Vec<u8>>,
    pub destination: Destination,
}

/// A parsed head plus the framing facts needed to read the body.
struct ParsedHead {
    request: HttpRequest,
    head_len: usize,
    content_length: Option<usize>,
}

impl HttpRequest {
    /// Parse a request from a complete in-memory buffer.
    ///
    /// Fails with `Incomplete` when the head terminator or part of the
    /// declared body is missing.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let head_end = find_head_end(data).ok_or(ParseError::Incomplete)?;
        let ParsedHead {
            mut request,
            head_len,
            content_length,
        } = parse_head(&data[..head_end])?;

        if let Some(len) = content_length.filter(|&n| n > 0) {
            let body = data.get(head_len..head_len + len).ok_or(ParseError::Incomplete)?;
            request.body = Some(body.to_vec());
        }
        Ok(request)
    }

    /// First header with the given name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        get_header(&self.headers, name)
    }

    /// Path and query as forwarded upstream.
    pub fn path(&self) -> &str {
        &self.destination.path
    }

    pub fn host(&self) -> &str {
        &self.destination.host
    }

    pub fn port(&self) -> u16 {
        self.destination.port
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    /// Rebuild the request for the upstream server.
    ///
    /// The request line uses origin-form. `Proxy-Connection` and every
    /// `Connection` header are dropped and a single `Connection: close` is
    /// appended; all other headers keep their order and casing.
    pub fn serialize(&self) -> Vec<u8> {
        let body_len = self.body.as_ref().map_or(0, Vec::len);
        let mut out = Vec::with_capacity(256 + body_len);

        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.destination.path.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.version.as_str().as_bytes());
        out.extend_from_slice(b"\r\n");

        if self.header("host").is_none() {
            let host = ("Host".to_string(), self.destination.authority().into_bytes());
            write_headers(&mut out, [&host]);
        }
        write_headers(
            &mut out,
            self.headers.iter().filter(|(name, _)| !is_connection_header(name)),
        );
        out.extend_from_slice(b"Connection: close\r\n\r\n");

        if let Some(body) = &self.body {
            out.extend_from_slice(body);
        }
        out
    }
}

/// Read one request from the client.
///
/// Buffers the head, parses it, then reads exactly `Content-Length` body
/// bytes. Bytes after the body are discarded; pipelining is not supported.
///
/// With `read_timeout` set, the whole head must arrive within it and each
/// body read is bounded by it separately, so a slow upload that keeps
/// making progress is not cut off.
pub async fn read_request<R>(
    reader: &mut R,
    limits: &Limits,
    read_timeout: Option<Duration>,
) -> Result<HttpRequest, ParseError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(4096);
    let head = read_head(reader, &mut buf, limits.max_head_bytes, None);
    let head = match read_timeout {
        Some(limit) => tokio::time::timeout(limit, head)
            .await
            .unwrap_or(Err(HeadReadError::TimedOut)),
        None => head.await,
    };
    let head_len = head.map_err(|e| match e {
        HeadReadError::Closed => ParseError::Incomplete,
        HeadReadError::TooLarge => ParseError::TooLarge("head"),
        HeadReadError::TimedOut => ParseError::TimedOut,
        HeadReadError::Io(e) => ParseError::Io(e),
    })?;
    if head_len > limits.max_head_bytes {
        return Err(ParseError::TooLarge("head"));
    }

    let ParsedHead {
        mut request,
        content_length,
        ..
    } = parse_head(&buf[..head_len])?;

    if let Some(len) = content_length.filter(|&n| n > 0) {
        if len > limits.max_body_bytes {
            return Err(ParseError::TooLarge("body"));
        }
        let mut body = buf.split_off(head_len);
        body.truncate(len);
        let mut filled = body.len();
        body.resize(len, 0);
        while filled < len {
            let n = read_with_timeout(reader, &mut body[filled..], read_timeout)
                .await
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::TimedOut => ParseError::TimedOut,
                    _ => ParseError::Io(e),
                })?;
            if n == 0 {
                return Err(ParseError::Incomplete);
            }
            filled += n;
        }
        request.body = Some(body);
    }

    tracing::debug!(
        method = %request.method,
        host = %request.destination.host,
        port = request.destination.port,
        path = %request.destination.path,
        body_len = request.body.as_ref().map_or(0, Vec::len),
        "Request read"
    );
    Ok(request)
}

fn parse_head(head: &[u8]) -> Result<ParsedHead, ParseError> {
    let mut header_buf = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut header_buf);

    let head_len = match req.parse(head) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Err(ParseError::Incomplete),
        Err(httparse::Error::TooManyHeaders) => return Err(ParseError::TooLarge("header count")),
        Err(e) => return Err(ParseError::Malformed(e.to_string())),
    };

    let method = req
        .method
        .ok_or_else(|| ParseError::Malformed("missing method".into()))?
        .to_string();
    let target = req
        .path
        .ok_or_else(|| ParseError::Malformed("missing request target".into()))?
        .to_string();
    let version = req
        .version
        .and_then(Version::from_minor)
        .ok_or_else(|| ParseError::Malformed("unsupported HTTP version".into()))?;
    let headers = collect_headers(req.headers);

    if method.eq_ignore_ascii_case("CONNECT") {
        return Err(ParseError::Unsupported("CONNECT tunneling"));
    }
    // Checked before the destination so chunked requests are always
    // reported as unsupported.
    if has_header(&headers, "transfer-encoding") {
        return Err(ParseError::Unsupported("Transfer-Encoding request bodies"));
    }

    let content_length = content_length(&headers)?;
    let destination = resolve_destination(&target, &headers)?;

    Ok(ParsedHead {
        request: HttpRequest {
            method,
            target,
            version,
            headers,
            body: None,
            destination,
        },
        head_len,
        content_length,
    })
}

/// The declared body length; duplicates must agree.
fn content_length(headers: &[Header]) -> Result<Option<usize>, ParseError> {
    let mut found: Option<usize> = None;
    for (_, value) in headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("content-length"))
    {
        let value = std::str::from_utf8(value)
            .ok()
            .filter(|v| !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()))
            .ok_or_else(|| {
                ParseError::Malformed(format!(
                    "invalid Content-Length: {}",
                    String::from_utf8_lossy(value)
                ))
            })?;
        let len: usize = value
            .parse()
            .map_err(|_| ParseError::Malformed(format!("invalid Content-Length: {value}")))?;
        match found {
            Some(prev) if prev != len => {
                return Err(ParseError::Malformed("conflicting Content-Length headers".into()));
            }
            _ => found = Some(len),
        }
    }
    Ok(found)
}

fn resolve_destination(target: &str, headers: &[Header]) -> Result<Destination, ParseError> {
    if let Some((scheme, rest)) = target.split_once("://") {
        if !scheme.eq_ignore_ascii_case("http") {
            return Err(ParseError::Unsupported("only http:// targets can be proxied"));
        }
        let split = rest.find(&['/', '?', '#'][..]).unwrap_or(rest.len());
        let (authority, path) = rest.split_at(split);
        // Userinfo is never forwarded.
        let authority = authority.rsplit_once('@').map_or(authority, |(_, a)| a);
        let (host, port) = split_host_port(authority)?;
        if host.is_empty() {
            return Err(ParseError::NoHost);
        }

        let path = path.split('#').next().unwrap_or_default();
        let path = if path.is_empty() {
            "/".to_string()
        } else if path.starts_with('?') {
            format!("/{path}")
        } else {
            path.to_string()
        };
        return Ok(Destination { host, port, path });
    }

    if !target.starts_with('/') && target != "*" {
        return Err(ParseError::Malformed(format!(
            "request target must be origin-form or absolute-form: {target}"
        )));
    }

    let host_header = match get_header(headers, "host") {
        Some(host) if !host.trim().is_empty() => host.trim(),
        Some(_) => return Err(ParseError::NoHost),
        None if has_header(headers, "host") => {
            return Err(ParseError::Malformed("Host header is not valid UTF-8".into()));
        }
        None => return Err(ParseError::NoHost),
    };
    let (host, port) = split_host_port(host_header)?;
    if host.is_empty() {
        return Err(ParseError::NoHost);
    }

    Ok(Destination {
        host,
        port,
        path: target.to_string(),
    })
}

/// Split `host[:port]` (or `[v6]:port`), defaulting to port 80.
fn split_host_port(authority: &str) -> Result<(String, u16), ParseError> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| ParseError::Malformed("unterminated IPv6 literal".into()))?;
        let port = match after {
            "" => DEFAULT_HTTP_PORT,
            other => {
                let port = other
                    .strip_prefix(':')
                    .ok_or_else(|| ParseError::Malformed(format!("invalid authority: {authority}")))?;
                parse_port(port)?
            }
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), parse_port(port)?)),
        None => Ok((authority.to_string(), DEFAULT_HTTP_PORT)),
    }
}

fn parse_port(port: &str) -> Result<u16, ParseError> {
    if port.is_empty() {
        return Ok(DEFAULT_HTTP_PORT);
    }
    match port.parse::<u16>() {
        Ok(p) if p != 0 && port.bytes().all(|b| b.is_ascii_digit()) => Ok(p),
        _ => Err(ParseError::Malformed(format!("invalid port: {port}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn parse(raw: &str) -> Result<HttpRequest, ParseError> {
        HttpRequest::parse(raw.as_bytes())
    }

    #[test]
    fn origin_form_uses_host_header() {
        let req = parse("GET /index.html?x=1 HTTP/1.1\r\nHost: example.org:8080\r\n\r\n").unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.version, Version::Http11);
        assert_eq!(req.host(), "example.org");
        assert_eq!(req.port(), 8080);
        assert_eq!(req.path(), "/index.html?x=1");
        assert!(!req.has_body());
    }

    #[test]
    fn absolute_form_wins_over_host_header() {
        let req = parse(
            "GET http://api.example.com:81/v1/items?id=7 HTTP/1.0\r\nHost: other.example\r\n\r\n",
        )
        .unwrap();
        assert_eq!(req.version, Version::Http10);
        assert_eq!(req.host(), "api.example.com");
        assert_eq!(req.port(), 81);
        assert_eq!(req.path(), "/v1/items?id=7");
        assert_eq!(req.target, "http://api.example.com:81/v1/items?id=7");
    }

    #[test]
    fn absolute_form_defaults() {
        let req = parse("GET http://user:pw@example.org HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.host(), "example.org");
        assert_eq!(req.port(), 80);
        assert_eq!(req.path(), "/");

        let req = parse("GET http://example.org?q=1#frag HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.path(), "/?q=1");
    }

    #[test]
    fn ipv6_literals() {
        let req = parse("GET http://[::1]:8080/ HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.host(), "::1");
        assert_eq!(req.port(), 8080);
        assert_eq!(req.destination.authority(), "[::1]:8080");

        let req = parse("GET / HTTP/1.1\r\nHost: [fe80::2]\r\n\r\n").unwrap();
        assert_eq!(req.host(), "fe80::2");
        assert_eq!(req.port(), 80);
    }

    #[test]
    fn missing_host_is_no_host() {
        assert!(matches!(parse("GET / HTTP/1.1\r\n\r\n"), Err(ParseError::NoHost)));
        assert!(matches!(
            parse("GET / HTTP/1.1\r\nHost:   \r\n\r\n"),
            Err(ParseError::NoHost)
        ));
        assert!(matches!(
            parse("GET http:///path HTTP/1.1\r\n\r\n"),
            Err(ParseError::NoHost)
        ));
    }

    #[test]
    fn chunked_requests_are_unsupported() {
        let raw = "POST /upload HTTP/1.1\r\nHost: example.org\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
        assert!(matches!(parse(raw), Err(ParseError::Unsupported(_))));

        // Even without a host, the framing problem is what gets reported.
        let raw = "POST / HTTP/1.1\r\ntransfer-encoding: gzip, Chunked\r\n\r\n";
        assert!(matches!(parse(raw), Err(ParseError::Unsupported(_))));
    }

    #[test]
    fn connect_and_https_are_unsupported() {
        assert!(matches!(
            parse("CONNECT example.org:443 HTTP/1.1\r\nHost: example.org:443\r\n\r\n"),
            Err(ParseError::Unsupported(_))
        ));
        assert!(matches!(
            parse("GET https://example.org/ HTTP/1.1\r\n\r\n"),
            Err(ParseError::Unsupported(_))
        ));
    }

    #[test]
    fn malformed_heads() {
        assert!(matches!(
            parse("GET\r\nHost: example.org\r\n\r\n"),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(
            parse("GET / HTTP/1.1\r\nno colon here\r\n\r\n"),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(
            parse("GET / HTTP/2.0\r\nHost: example.org\r\n\r\n"),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(
            parse("GET / HTTP/1.1\r\nHost: example.org:http\r\n\r\n"),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(
            parse("GET relative HTTP/1.1\r\nHost: example.org\r\n\r\n"),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn non_utf8_header_values_are_kept() {
        let raw = b"GET http://example.org/ HTTP/1.1\r\nX-Name: caf\xe9\r\nAccept: */*\r\n\r\n";
        let req = HttpRequest::parse(raw).unwrap();
        assert_eq!(req.headers[0], ("X-Name".to_string(), b"caf\xe9".to_vec()));
        assert_eq!(req.header("x-name"), None);

        let out = req.serialize();
        let expected: &[u8] = b"GET / HTTP/1.1\r\nHost: example.org\r\nX-Name: caf\xe9\r\nAccept: */*\r\nConnection: close\r\n\r\n";
        assert_eq!(out, expected);
    }

    #[test]
    fn non_utf8_host_header_is_malformed() {
        let raw = b"GET / HTTP/1.1\r\nHost: caf\xe9.example\r\n\r\n";
        assert!(matches!(HttpRequest::parse(raw), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn content_length_body() {
        let req = parse("POST /form HTTP/1.1\r\nHost: example.org\r\nContent-Length: 5\r\n\r\nhello").unwrap();
        assert_eq!(req.body.as_deref(), Some(&b"hello"[..]));

        let req = parse("POST /form HTTP/1.1\r\nHost: example.org\r\nContent-Length: 0\r\n\r\n").unwrap();
        assert!(req.body.is_none());

        assert!(matches!(
            parse("POST /form HTTP/1.1\r\nHost: example.org\r\nContent-Length: 10\r\n\r\nshort"),
            Err(ParseError::Incomplete)
        ));
        assert!(matches!(
            parse("POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\nabcd"),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(
            parse("POST / HTTP/1.1\r\nHost: a\r\nContent-Length: +3\r\n\r\nabc"),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn serialize_rewrites_connection_headers() {
        let req = parse(
            "GET http://example.org/a?b=c HTTP/1.1\r\n\
             Host: example.org\r\n\
             Proxy-Connection: keep-alive\r\n\
             Connection: keep-alive\r\n\
             Accept: text/html\r\n\
             X-Dup: one\r\n\
             connection: Upgrade\r\n\
             X-Dup: two\r\n\r\n",
        )
        .unwrap();
        let out = String::from_utf8(req.serialize()).unwrap();

        assert_eq!(
            out,
            "GET /a?b=c HTTP/1.1\r\n\
             Host: example.org\r\n\
             Accept: text/html\r\n\
             X-Dup: one\r\n\
             X-Dup: two\r\n\
             Connection: close\r\n\r\n"
        );
    }

    #[test]
    fn serialize_round_trips() {
        let req = parse(
            "POST /submit HTTP/1.1\r\nHost: example.org\r\nContent-Type: text/plain\r\nContent-Length: 4\r\n\r\nping",
        )
        .unwrap();
        let reparsed = HttpRequest::parse(&req.serialize()).unwrap();

        assert_eq!(reparsed.method, req.method);
        assert_eq!(reparsed.path(), req.path());
        assert_eq!(reparsed.body, req.body);
        let connection: Vec<_> = reparsed
            .headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("connection"))
            .collect();
        assert_eq!(connection.len(), 1);
        assert_eq!(connection[0].1, b"close");
        assert_eq!(&reparsed.headers[..3], &req.headers[..]);
    }

    #[test]
    fn serialize_adds_missing_host() {
        let req = parse("GET http://example.org:8080/ HTTP/1.0\r\nAccept: */*\r\n\r\n").unwrap();
        let out = String::from_utf8(req.serialize()).unwrap();
        assert!(out.starts_with("GET / HTTP/1.0\r\nHost: example.org:8080\r\nAccept: */*\r\n"));
    }

    #[tokio::test]
    async fn read_request_reads_body_across_reads() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            client
                .write_all(b"POST /p HTTP/1.1\r\nHost: example.org\r\nContent-Length: 11\r\n\r\nhello")
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            client.write_all(b" world").await.unwrap();
            client
        });

        let req = read_request(&mut server, &Limits::default(), None).await.unwrap();
        assert_eq!(req.body.as_deref(), Some(&b"hello world"[..]));
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn slow_body_is_not_cut_off_while_it_progresses() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            client
                .write_all(b"POST /p HTTP/1.1\r\nHost: example.org\r\nContent-Length: 4\r\n\r\n")
                .await
                .unwrap();
            for byte in b"abcd" {
                tokio::time::sleep(Duration::from_millis(60)).await;
                client.write_all(&[*byte]).await.unwrap();
            }
            client
        });

        let req = read_request(&mut server, &Limits::default(), Some(Duration::from_millis(150)))
            .await
            .unwrap();
        assert_eq!(req.body.as_deref(), Some(&b"abcd"[..]));
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn stalled_body_times_out() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(b"POST /p HTTP/1.1\r\nHost: example.org\r\nContent-Length: 9\r\n\r\nabc")
            .await
            .unwrap();

        let err = read_request(&mut server, &Limits::default(), Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::TimedOut));
        drop(client);
    }

    #[tokio::test]
    async fn stalled_head_times_out() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        let err = read_request(&mut server, &Limits::default(), Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::TimedOut));
        drop(client);
    }

    #[tokio::test]
    async fn read_request_incomplete_on_early_close() {
        let mut input: &[u8] = b"GET / HTTP/1.1\r\n";
        let err = read_request(&mut input, &Limits::default(), None).await.unwrap_err();
        assert!(matches!(err, ParseError::Incomplete));

        let mut input: &[u8] = b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 9\r\n\r\nabc";
        let err = read_request(&mut input, &Limits::default(), None).await.unwrap_err();
        assert!(matches!(err, ParseError::Incomplete));
    }

    #[tokio::test]
    async fn read_request_enforces_body_limit() {
        let limits = Limits {
            max_head_bytes: 1024,
            max_body_bytes: 4,
        };
        let mut input: &[u8] = b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhello";
        let err = read_request(&mut input, &limits, None).await.unwrap_err();
        assert!(matches!(err, ParseError::TooLarge("body")));
    }
}
