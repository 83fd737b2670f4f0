//! Accept loop.
//!
//! # Responsibilities
//! - Accept connections and spawn one task per connection
//! - Stop accepting on shutdown and drain in-flight connections
//!
//! # Design Decisions
//! - The accept loop never awaits a connection's work
//! - Accept errors are logged and the loop keeps going
//! - Draining is bounded by the configured grace period

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::net::{ConnectionTracker, Listener, ListenerError};
use crate::proxy::handler::{handle_connection, ProxyContext};

/// Pause after a failed accept so a persistent error (e.g. EMFILE) cannot spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// The forward proxy's connection dispatcher.
pub struct ProxyServer {
    listener: Listener,
    context: Arc<ProxyContext>,
    tracker: ConnectionTracker,
    shutdown_grace: Duration,
}

impl ProxyServer {
    pub fn new(listener: Listener, context: Arc<ProxyContext>, shutdown_grace: Duration) -> Self {
        Self {
            listener,
            context,
            tracker: ConnectionTracker::new(),
            shutdown_grace,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle on the live-connection counter.
    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Accept until `shutdown` fires, then drain.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ListenerError> {
        let local_addr = self.listener.local_addr().ok();
        tracing::info!(address = ?local_addr, "Proxy accepting connections");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, no longer accepting");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, client, permit)) => {
                        let guard = self.tracker.track();
                        let context = Arc::clone(&self.context);
                        tokio::spawn(async move {
                            let _permit = permit;
                            handle_connection(stream, client, guard.id(), context).await;
                            drop(guard);
                        });
                    }
                    Err(ListenerError::Closed) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        // Stop listening before draining so new clients are refused.
        let Self {
            listener,
            tracker,
            shutdown_grace,
            ..
        } = self;
        drop(listener);

        let in_flight = tracker.active_count();
        if in_flight > 0 {
            tracing::info!(
                connections = in_flight,
                grace_secs = shutdown_grace.as_secs(),
                "Draining connections"
            );
        }
        if tracker.drain(shutdown_grace).await {
            tracing::info!("All connections closed");
        } else {
            tracing::warn!(
                remaining = tracker.active_count(),
                "Grace period elapsed with connections still open"
            );
        }
        Ok(())
    }
}
