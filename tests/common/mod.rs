//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use forward_proxy::config::ProxyConfig;
use forward_proxy::http::find_head_end;
use forward_proxy::lifecycle::{startup, Shutdown};
use forward_proxy::observability::{MemorySink, MetricsSink};
use forward_proxy::TransactionRecord;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Raw requests received by a mock backend, in arrival order.
pub type Received = Arc<Mutex<Vec<Vec<u8>>>>;

/// Read a request head plus any `Content-Length` body from `socket`.
async fn read_request(socket: &mut TcpStream) -> Vec<u8> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        if let Some(end) = find_head_end(&data) {
            let head = String::from_utf8_lossy(&data[..end]).to_ascii_lowercase();
            let body_len = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if data.len() >= end + body_len {
                return data;
            }
        }
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return data,
            Ok(n) => data.extend_from_slice(&buf[..n]),
        }
    }
}

/// Start a backend that answers every request with raw `response` bytes and closes.
pub async fn start_raw_backend(response: impl Into<Vec<u8>>) -> (SocketAddr, Received) {
    let response: Arc<Vec<u8>> = Arc::new(response.into());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let received: Received = Arc::default();

    let log = received.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let response = response.clone();
            let log = log.clone();
            tokio::spawn(async move {
                let request = read_request(&mut socket).await;
                log.lock().unwrap().push(request);
                let _ = socket.write_all(&response).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (addr, received)
}

/// Start a simple mock backend that returns a fixed 200 response.
pub async fn start_mock_backend(body: &'static str) -> (SocketAddr, Received) {
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    start_raw_backend(response).await
}

/// Start a programmable mock backend with async support.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let f = f.clone();
            tokio::spawn(async move {
                let request = read_request(&mut socket).await;
                let (status, body) = f(request).await;
                let status_text = match status {
                    200 => "200 OK",
                    201 => "201 Created",
                    404 => "404 Not Found",
                    500 => "500 Internal Server Error",
                    _ => "200 OK",
                };
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\n\r\n{}",
                    status_text,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

/// A port nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// A proxy running on an ephemeral port with an in-memory sink.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub sink: Arc<MemorySink>,
    pub shutdown: Shutdown,
    pub handle: JoinHandle<()>,
}

impl TestProxy {
    pub fn records(&self) -> Vec<TransactionRecord> {
        self.sink.records()
    }

    /// Wait until at least `count` records arrived.
    pub async fn wait_for_records(&self, count: usize) -> Vec<TransactionRecord> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.sink.len() < count && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.sink.records()
    }
}

/// Start a proxy; `configure` adjusts the defaults before startup.
pub async fn start_proxy(configure: impl FnOnce(&mut ProxyConfig)) -> TestProxy {
    let mut config = ProxyConfig::default();
    config.listener.port = 0;
    config.filter.blocked_keywords.clear();
    config.timeouts.read_secs = 2;
    config.timeouts.connect_secs = 2;
    config.timeouts.shutdown_grace_secs = 1;
    configure(&mut config);

    let sink = Arc::new(MemorySink::new());
    let context =
        startup::build_context_with_sink(&config, sink.clone() as Arc<dyn MetricsSink>).unwrap();
    let server = startup::bind_server(&config, context).await.unwrap();
    let addr = server.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let receiver = shutdown.subscribe();
    let handle = tokio::spawn(async move {
        server.run(receiver).await.unwrap();
    });

    TestProxy {
        addr,
        sink,
        shutdown,
        handle,
    }
}

/// Write `request` to the proxy and read until it closes the connection.
pub async fn send_raw(proxy: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut response));
    match read.await {
        Ok(Ok(_)) => {}
        // A reset after a close still counts as closed.
        Ok(Err(_)) => {}
        Err(_) => panic!("proxy did not close the connection"),
    }
    response
}

/// Status code of a raw HTTP response.
pub fn status_of(response: &[u8]) -> Option<u16> {
    let line = response.split(|&b| b == b'\r').next()?;
    let line = std::str::from_utf8(line).ok()?;
    line.split_whitespace().nth(1)?.parse().ok()
}

/// Body of a raw HTTP response.
pub fn body_of(response: &[u8]) -> &[u8] {
    match find_head_end(response) {
        Some(end) => &response[end..],
        None => &[],
    }
}
