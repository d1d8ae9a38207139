//! Application callback traits.
//!
//! # Responsibilities
//! - [`Handler`]: turn a request (plus its body reader) into a [`Reply`]
//! - [`SocketHandler`]: react to messages on an upgraded WebSocket connection
//!
//! # Design Decisions
//! - `Handler` is async and shared across connections (`&self`)
//! - `SocketHandler` is synchronous and owned by exactly one connection, so it
//!   keeps its state in `&mut self` without locking
//! - Panics in either are caught once at the connection boundary

use std::future::Future;

use bytes::Bytes;

use crate::http::body::Body;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::websocket::handshake::WebSocketUpgrade;

/// Error type returned by application callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What the application wants done with a request.
#[derive(Debug)]
pub enum Reply {
    /// Write this response.
    Response(Response),
    /// Switch the connection to WebSocket and hand it to a socket handler.
    Upgrade(WebSocketUpgrade),
}

impl From<Response> for Reply {
    fn from(response: Response) -> Self {
        Reply::Response(response)
    }
}

impl From<WebSocketUpgrade> for Reply {
    fn from(upgrade: WebSocketUpgrade) -> Self {
        Reply::Upgrade(upgrade)
    }
}

/// Serves HTTP requests.
pub trait Handler: Send + Sync + 'static {
    /// Handle one request. The body has not been read; the handler may read
    /// some, all or none of it.
    fn handle_request(
        &self,
        request: Request,
        body: &mut Body<'_>,
    ) -> impl Future<Output = Result<Reply, BoxError>> + Send;
}

/// A complete WebSocket message, or a control frame surfaced to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
}

/// Close code and reason sent when the application stops a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// The application's answer to a WebSocket event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketReply {
    Continue,
    Reply(Vec<Message>),
    /// Close the connection; `None` sends close code 1000.
    Stop(Option<CloseReason>),
}

/// Why a WebSocket connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminateReason {
    Normal,
    Error(String),
    Remote,
    Shutdown,
    Timeout,
}

impl TerminateReason {
    /// Short label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            TerminateReason::Normal => "normal",
            TerminateReason::Error(_) => "error",
            TerminateReason::Remote => "remote",
            TerminateReason::Shutdown => "shutdown",
            TerminateReason::Timeout => "timeout",
        }
    }
}

/// Per-connection WebSocket application.
pub trait SocketHandler: Send {
    /// Called once, right after the handshake response is sent.
    fn init(&mut self) -> SocketReply {
        SocketReply::Continue
    }

    /// Called for every complete message and every ping/pong.
    fn handle(&mut self, message: Message) -> SocketReply;

    /// Called when the peer starts the close handshake.
    fn on_close(&mut self, _code: Option<u16>, _reason: &str) {}

    /// Called exactly once when the connection ends, whatever the cause.
    fn terminate(&mut self, _reason: &TerminateReason) {}
}
