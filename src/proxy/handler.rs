//! Per-connection request pipeline.
//!
//! # Data Flow
//! ```text
//! Accepted
//!     → Parsing    read_request: head under one deadline, each body read bounded
//!                  (400 or silent close on error)
//!     → Filtering  FilterEngine::evaluate
//!     → Relaying   Relay::reject (403) | Relay::forward
//!     → Closed     record → metrics + sink, then the socket is shut down
//! ```
//!
//! # Design Decisions
//! - Exactly one request per connection
//! - The record is emitted before the client socket is released
//! - A panic in any stage is caught; the record still goes out

use futures_util::FutureExt;
use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::filter::{FilterDecision, FilterEngine};
use crate::http::{read_request, write_with_timeout, HttpResponse, Limits, ParseError};
use crate::net::{ConnectionId, ConnectionState};
use crate::observability::{metrics, MetricsSink};
use crate::proxy::relay::Relay;
use crate::proxy::transaction::{Outcome, TransactionBuilder};

/// Everything a connection task needs, shared across all connections.
pub struct ProxyContext {
    pub filter: Arc<FilterEngine>,
    pub relay: Relay,
    pub sink: Arc<dyn MetricsSink>,
    pub limits: Limits,
    /// Deadline for the request head, and the bound on each body read and
    /// on writes of proxy-generated responses.
    pub read_timeout: Duration,
}

impl std::fmt::Debug for ProxyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyContext")
            .field("filter", &self.filter)
            .field("relay", &self.relay)
            .field("limits", &self.limits)
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

/// Serve one client connection from accept to close.
pub async fn handle_connection<S>(
    mut stream: S,
    client: SocketAddr,
    id: ConnectionId,
    ctx: Arc<ProxyContext>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    tracing::info!(connection_id = %id, client = %client, "connection_accepted");

    let mut builder = TransactionBuilder::new(id, client);
    let mut state = ConnectionState::Accepted;

    let pipeline = run_pipeline(&mut stream, &ctx, &mut builder, &mut state, id);
    let result = AssertUnwindSafe(pipeline).catch_unwind().await;
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(panic) => {
            tracing::error!(
                connection_id = %id,
                client = %client,
                state = %state,
                panic = %panic_message(panic.as_ref()),
                "connection_error"
            );
            outcome_after_panic(state)
        }
    };
    state = ConnectionState::Closed;

    let record = builder.finish(outcome);
    metrics::record_transaction(&record);
    tracing::info!(
        connection_id = %id,
        client = %client,
        host = record.destination_host.as_deref().unwrap_or("-"),
        outcome = %record.outcome,
        status = record.status_code,
        latency_ms = record.latency().as_millis() as u64,
        state = %state,
        "connection_closed"
    );
    ctx.sink.record(record);

    let _ = tokio::time::timeout(ctx.read_timeout, stream.shutdown()).await;
}

async fn run_pipeline<S>(
    stream: &mut S,
    ctx: &ProxyContext,
    builder: &mut TransactionBuilder,
    state: &mut ConnectionState,
    id: ConnectionId,
) -> Outcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    *state = ConnectionState::Parsing;
    let parsed = read_request(&mut *stream, &ctx.limits, Some(ctx.read_timeout)).await;
    let request = match parsed {
        Ok(request) => request,
        Err(e) => {
            reject_malformed(stream, id, e, ctx.read_timeout).await;
            return Outcome::ParseError;
        }
    };

    builder.request(&request);
    tracing::info!(
        connection_id = %id,
        method = %request.method,
        host = %request.host(),
        port = request.port(),
        path = %request.path(),
        "request_parsed"
    );

    *state = ConnectionState::Filtering;
    let decision = ctx.filter.evaluate(request.host(), request.path());

    *state = ConnectionState::Relaying;
    match decision {
        FilterDecision::Block(reason) => {
            tracing::warn!(
                connection_id = %id,
                host = %request.host(),
                reason = %reason,
                outcome = %Outcome::Blocked,
                "request_blocked"
            );
            let report = ctx.relay.reject(stream, request.host(), &reason).await;
            if let Err(e) = &report.result {
                tracing::debug!(connection_id = %id, error = %e, "403 not delivered");
            }
            builder.relay(&report);
            Outcome::Blocked
        }
        FilterDecision::Allow => {
            let report = ctx.relay.forward(stream, &request).await;
            builder.relay(&report);
            match &report.result {
                Ok(()) => {
                    tracing::info!(
                        connection_id = %id,
                        host = %request.host(),
                        status = report.status_code,
                        bytes_sent = report.bytes_sent,
                        bytes_received = report.bytes_received,
                        outcome = %Outcome::Success,
                        "request_forwarded"
                    );
                    Outcome::Success
                }
                Err(e) => {
                    tracing::warn!(
                        connection_id = %id,
                        host = %request.host(),
                        error = %e,
                        outcome = %Outcome::UpstreamError,
                        "connection_error"
                    );
                    Outcome::UpstreamError
                }
            }
        }
    }
}

/// Log a parse failure and, when the client is still there, answer 400.
async fn reject_malformed<S>(stream: &mut S, id: ConnectionId, error: ParseError, timeout: Duration)
where
    S: AsyncWrite + Unpin,
{
    tracing::warn!(
        connection_id = %id,
        error = %error,
        outcome = %Outcome::ParseError,
        "connection_error"
    );
    if !error.wants_response() {
        return;
    }

    let response = HttpResponse::bad_request().to_bytes();
    if let Err(e) = write_with_timeout(stream, &response, Some(timeout)).await {
        tracing::debug!(connection_id = %id, error = %e, "400 not delivered");
    }
}

/// Outcome for a pipeline that panicked in `state`.
fn outcome_after_panic(state: ConnectionState) -> Outcome {
    match state {
        ConnectionState::Accepted | ConnectionState::Parsing => Outcome::ParseError,
        ConnectionState::Filtering | ConnectionState::Relaying | ConnectionState::Closed => {
            Outcome::UpstreamError
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
