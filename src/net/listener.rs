//! Bounded TCP listener.
//!
//! # Responsibilities
//! - Bind the configured address
//! - Hold back `accept()` while `max_connections` connections are open
//! - Hand each accepted socket over as an [`Accepted`] with its addresses
//!   and the slot it occupies

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ListenerConfig;
use crate::net::transport::ConnectionInfo;

/// Error type for listener operations.
#[derive(Debug)]
pub enum ListenerError {
    /// The address could not be parsed or bound.
    Bind(std::io::Error),
    /// `accept(2)` failed; usually transient (e.g. EMFILE).
    Accept(std::io::Error),
    /// The slot semaphore was closed; no further connections can be admitted.
    Closed,
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerError::Bind(e) => write!(f, "Failed to bind listener: {}", e),
            ListenerError::Accept(e) => write!(f, "Failed to accept connection: {}", e),
            ListenerError::Closed => write!(f, "Connection slots closed"),
        }
    }
}

impl std::error::Error for ListenerError {}

/// A socket accepted by [`Listener::accept`].
#[derive(Debug)]
pub struct Accepted {
    pub stream: TcpStream,
    pub info: ConnectionInfo,
    /// Keep alive for as long as the connection is open.
    pub permit: ConnectionPermit,
}

/// A TCP listener admitting at most `max_connections` open connections.
///
/// Once every slot is taken, `accept()` stops pulling sockets off the
/// kernel backlog until a [`ConnectionPermit`] is dropped.
pub struct Listener {
    inner: TcpListener,
    slots: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    /// Bind `config.bind_address`.
    pub async fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
            ListenerError::Bind(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;
        let tcp = TcpListener::bind(addr).await.map_err(ListenerError::Bind)?;
        Self::from_tcp(tcp, config.max_connections)
    }

    /// Wrap a listener the embedder already bound (e.g. on port 0).
    pub fn from_tcp(tcp: TcpListener, max_connections: usize) -> Result<Self, ListenerError> {
        let address = tcp.local_addr().map_err(ListenerError::Bind)?;
        tracing::info!(address = %address, max_connections, "Listener bound");

        Ok(Self {
            inner: tcp,
            slots: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        })
    }

    /// Wait for a free slot, then for the next connection.
    pub async fn accept(&self) -> Result<Accepted, ListenerError> {
        if self.slots.available_permits() == 0 {
            tracing::debug!(
                max_connections = self.max_connections,
                "Connection limit reached, waiting for a slot"
            );
        }
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Closed)?;

        let (stream, peer_addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
        }
        let info = ConnectionInfo {
            peer_addr: Some(peer_addr),
            local_addr: stream.local_addr().ok(),
            secure: false,
        };

        tracing::trace!(
            peer_addr = %peer_addr,
            free_slots = self.slots.available_permits(),
            "Connection accepted"
        );

        Ok(Accepted {
            stream,
            info,
            permit: ConnectionPermit { _permit: permit },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }

    /// Slots not held by an open connection.
    pub fn available_permits(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// One occupied connection slot, released on drop (also when the
/// connection task panics).
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}
