//! Embeddable HTTP/1.x server core with a WebSocket engine.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod websocket;

pub use config::ServerConfig;
pub use http::{
    Body, BoxError, Handler, HttpServer, Message, Reply, Request, Response, SocketHandler,
    SocketReply,
};
pub use lifecycle::Shutdown;
pub use net::Listener;
pub use websocket::WebSocketUpgrade;
