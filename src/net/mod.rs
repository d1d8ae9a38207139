//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (ID, live-connection tracking)
//!     → transport.rs (stream + receive buffer owned by the connection task)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - Encryption belongs to the stream; any `AsyncRead + AsyncWrite` can be served

pub mod connection;
pub mod listener;
pub mod transport;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{Accepted, ConnectionPermit, Listener, ListenerError};
pub use transport::{ConnectionInfo, Transport, TransportError};
