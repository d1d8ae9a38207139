//! HTTP server: accept loop and per-connection tasks.
//!
//! # Responsibilities
//! - Accept connections from a bounded [`Listener`]
//! - Spawn one task per connection, owning its transport exclusively
//! - Attach a tracing span (`connection_id`, `peer_addr`) to each task
//! - Stop accepting on shutdown and let callers wait for live connections

use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use crate::config::ServerConfig;
use crate::http::connection::{ConnectionEnd, ConnectionSettings, HttpConnection};
use crate::http::handler::Handler;
use crate::lifecycle::shutdown::Shutdown;
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{Accepted, Listener, ListenerError};
use crate::net::transport::Transport;
use crate::observability::metrics;

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// HTTP/1.x and WebSocket server around an application [`Handler`].
pub struct HttpServer<H> {
    handler: Arc<H>,
    settings: Arc<ConnectionSettings>,
    tracker: ConnectionTracker,
    config: ServerConfig,
}

impl<H: Handler> HttpServer<H> {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: ServerConfig, handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
            settings: Arc::new(ConnectionSettings::from_config(&config)),
            tracker: ConnectionTracker::new(),
            config,
        }
    }

    /// Run the server, accepting connections on the given listener until
    /// `shutdown` fires. Connections already open keep running; use
    /// [`HttpServer::drain`] to wait for them.
    pub async fn run(&self, listener: Listener, shutdown: &Shutdown) -> Result<(), ListenerError> {
        let addr = listener.local_addr().map_err(ListenerError::Bind)?;
        tracing::info!(address = %addr, "HTTP server starting");

        let mut signal = shutdown.subscribe();
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = signal.wait() => break,
            };
            let Accepted {
                stream,
                info,
                permit,
            } = match accepted {
                Ok(accepted) => accepted,
                Err(ListenerError::Closed) => return Err(ListenerError::Closed),
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let guard = self.tracker.track();
            let span = tracing::info_span!(
                "connection",
                connection_id = %guard.id(),
                peer_addr = ?info.peer_addr
            );
            let connection = HttpConnection::new(
                Transport::new(stream, info),
                Arc::clone(&self.handler),
                Arc::clone(&self.settings),
            );
            let mut connection_signal = shutdown.subscribe();

            metrics::record_connection_opened();
            tokio::spawn(
                async move {
                    let _permit = permit;
                    let _guard = guard;
                    match connection.run(&mut connection_signal).await {
                        ConnectionEnd::Closed { requests } => {
                            tracing::trace!(requests, "Connection closed");
                        }
                        ConnectionEnd::Upgraded(reason) => {
                            tracing::trace!(reason = reason.label(), "WebSocket closed");
                        }
                    }
                    metrics::record_connection_closed();
                }
                .instrument(span),
            );
        }

        tracing::info!("HTTP server stopped accepting");
        Ok(())
    }

    /// Wait for live connections to close, up to `timeout`. Returns whether
    /// every connection finished in time.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let active = self.tracker.active_count();
        if active > 0 {
            tracing::info!(active, timeout = ?timeout, "Draining connections");
        }
        let drained = self.tracker.drain(timeout).await;
        if !drained {
            tracing::warn!(
                remaining = self.tracker.active_count(),
                "Connections still open after drain timeout"
            );
        }
        drained
    }

    /// Number of connections currently open.
    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
