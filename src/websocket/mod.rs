//! WebSocket engine.
//!
//! # Data Flow
//! ```text
//! HTTP request + Reply::Upgrade
//!     → handshake.rs (validate, accept key, 101 response)
//!     → extension.rs (permessage-deflate negotiation)
//!     → connection.rs (frame loop, close handshake)
//!         → frame.rs (wire codec)
//!         → assembler.rs (fragments, UTF-8, inflate)
//!         → deflate.rs (per-connection compression context)
//! ```

pub mod assembler;
pub mod close;
pub mod connection;
pub mod deflate;
pub mod extension;
pub mod frame;
pub mod handshake;

pub use close::CloseCode;
pub use connection::{WebSocketConnection, WsSettings};
pub use handshake::{accept_key, validate_upgrade, HandshakeError, WebSocketUpgrade};
