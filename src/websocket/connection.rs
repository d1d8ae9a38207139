//! WebSocket connection loop.
//!
//! # Responsibilities
//! - Decode frames from the transport and feed them to the [`Assembler`]
//! - Dispatch complete messages to the [`SocketHandler`] and send its replies
//! - Run the close handshake from either side
//! - Enforce the idle timeout and react to server shutdown
//!
//! # Data Flow
//! ```text
//! Open ──handler stop / panic / shutdown──▶ ClosingLocal ──peer close or timeout──▶ Closed
//! Open ──peer close──▶ echo close ──▶ Closed
//! Open ──violation / idle timeout──▶ send close ──▶ Closed
//! ```
//!
//! # Design Decisions
//! - Handler callbacks are synchronous and run inside `catch_unwind`; a panic
//!   closes the socket with 1011
//! - Pings are answered before the handler sees them
//! - `SocketHandler::terminate` runs exactly once, whatever ended the connection

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use bytes::Bytes;

use crate::http::handler::{Message, SocketHandler, SocketReply, TerminateReason};
use crate::lifecycle::shutdown::ShutdownSignal;
use crate::net::transport::{Transport, TransportError};
use crate::observability::metrics;
use crate::websocket::assembler::{Assembled, Assembler, ProtocolViolation};
use crate::websocket::close::{parse_close_payload, CloseCode};
use crate::websocket::deflate::CompressionContext;
use crate::websocket::extension::DeflateConfig;
use crate::websocket::frame::{deserialize_with_limit, serialize, Decoded, Frame, OpCode};

/// Limits and timeouts for one WebSocket connection.
#[derive(Debug, Clone, Copy)]
pub struct WsSettings {
    /// Largest accepted frame payload and reassembled message (0 = unlimited).
    pub max_frame_size: u64,
    pub validate_utf8: bool,
    /// Close with 1002 when no frame arrives for this long.
    pub idle_timeout: Option<Duration>,
    /// How long to wait for the peer's close frame after sending ours.
    pub close_timeout: Duration,
    /// Log peer disconnects at `warn` instead of `debug`.
    pub log_client_closures: bool,
}

impl Default for WsSettings {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            validate_utf8: true,
            idle_timeout: Some(Duration::from_secs(60)),
            close_timeout: Duration::from_secs(5),
            log_client_closures: false,
        }
    }
}

/// Why the open phase ended.
enum Exit {
    /// Send a close frame, then wait for the peer's.
    CloseLocal {
        code: u16,
        reason: String,
        terminate: TerminateReason,
    },
    /// Send the violation's close code and drop the connection.
    Violation(ProtocolViolation),
    /// The peer's close was echoed and the socket closed.
    Remote,
    Transport(TransportError),
    Timeout,
}

/// One upgraded connection, owned by its task.
pub struct WebSocketConnection<'t> {
    transport: &'t mut Transport,
    handler: Box<dyn SocketHandler>,
    assembler: Assembler,
    settings: WsSettings,
}

impl<'t> WebSocketConnection<'t> {
    /// Take over `transport`. Bytes already buffered on it are treated as frames.
    pub fn new(
        transport: &'t mut Transport,
        handler: Box<dyn SocketHandler>,
        deflate: Option<DeflateConfig>,
        settings: WsSettings,
    ) -> Self {
        let compression = deflate.as_ref().map(CompressionContext::new);
        let max_message = usize::try_from(settings.max_frame_size).unwrap_or(usize::MAX);
        Self {
            transport,
            handler,
            assembler: Assembler::new(compression, max_message, settings.validate_utf8),
            settings,
        }
    }

    /// Run until the connection closes. The socket is shut down on return.
    pub async fn run(mut self, shutdown: &mut ShutdownSignal) -> TerminateReason {
        let exit = self.open(shutdown).await;
        let reason = self.finish(exit).await;

        let terminated = &reason;
        if let Err(panic) = self.call(|h| h.terminate(terminated)) {
            tracing::error!(panic = %panic, "Socket handler panicked in terminate");
        }
        metrics::record_websocket_close(reason.label());
        tracing::debug!(reason = reason.label(), "WebSocket connection ended");
        reason
    }

    async fn open(&mut self, shutdown: &mut ShutdownSignal) -> Exit {
        match self.call(|h| h.init()) {
            Ok(reply) => {
                if let Some(exit) = self.apply(reply).await {
                    return exit;
                }
            }
            Err(panic) => return handler_panicked(panic),
        }

        let idle = self.settings.idle_timeout;
        loop {
            match deserialize_with_limit(self.transport.buffer(), self.settings.max_frame_size) {
                Ok(Decoded::Frame { frame, consumed }) => {
                    self.transport.consume(consumed);
                    if let Some(exit) = self.on_frame(frame).await {
                        return exit;
                    }
                    continue;
                }
                Ok(Decoded::Incomplete) => {}
                Err(e) => return Exit::Violation(ProtocolViolation::new(e.close_code(), e.to_string())),
            }

            let read = tokio::select! {
                read = self.transport.recv(idle) => read,
                _ = shutdown.wait() => {
                    return Exit::CloseLocal {
                        code: CloseCode::GOING_AWAY,
                        reason: String::new(),
                        terminate: TerminateReason::Shutdown,
                    };
                }
            };
            match read {
                Ok(_) => {}
                Err(TransportError::Timeout(_)) => return Exit::Timeout,
                Err(e) => return Exit::Transport(e),
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame) -> Option<Exit> {
        let message = match self.assembler.push(frame) {
            Ok(Assembled::Pending) => return None,
            Ok(Assembled::Close(payload)) => return Some(self.remote_close(payload).await),
            Ok(Assembled::Message(message)) => message,
            Err(violation) => return Some(Exit::Violation(violation)),
        };

        if let Message::Ping(data) = &message {
            if let Err(e) = self.send_frame(&Frame::pong(data.clone())).await {
                return Some(Exit::Transport(e));
            }
        }
        metrics::record_websocket_message("in");

        match self.call(move |h| h.handle(message)) {
            Ok(reply) => self.apply(reply).await,
            Err(panic) => Some(handler_panicked(panic)),
        }
    }

    /// Act on a handler reply. `None` means stay open.
    async fn apply(&mut self, reply: SocketReply) -> Option<Exit> {
        match reply {
            SocketReply::Continue => None,
            SocketReply::Reply(messages) => {
                for message in messages {
                    let frame = match self.assembler.encode(message) {
                        Ok(frame) => frame,
                        Err(e) => return Some(Exit::Violation(e.into())),
                    };
                    if let Err(e) = self.send_frame(&frame).await {
                        return Some(Exit::Transport(e));
                    }
                    metrics::record_websocket_message("out");
                }
                None
            }
            SocketReply::Stop(close) => {
                let (code, reason) = match close {
                    Some(close) => (close.code, close.reason),
                    None => (CloseCode::NORMAL, String::new()),
                };
                Some(Exit::CloseLocal {
                    code,
                    reason,
                    terminate: TerminateReason::Normal,
                })
            }
        }
    }

    /// Echo the peer's close and shut the socket.
    async fn remote_close(&mut self, payload: Bytes) -> Exit {
        let (code, reason) = match parse_close_payload(&payload) {
            Ok(parsed) => parsed,
            Err(e) => return Exit::Violation(ProtocolViolation::new(e.close_code(), e.to_string())),
        };
        tracing::debug!(code = ?code, reason = %reason, "Peer sent close");

        let _ = self.send_frame(&Frame::close(code, "")).await;
        if let Err(panic) = self.call(|h| h.on_close(code, &reason)) {
            tracing::error!(panic = %panic, "Socket handler panicked in on_close");
        }
        self.transport.close().await;
        Exit::Remote
    }

    async fn finish(&mut self, exit: Exit) -> TerminateReason {
        match exit {
            Exit::Remote => TerminateReason::Remote,
            Exit::CloseLocal {
                code,
                reason,
                terminate,
            } => {
                if self.send_frame(&Frame::close(Some(code), &reason)).await.is_ok() {
                    self.await_peer_close().await;
                }
                self.transport.close().await;
                terminate
            }
            Exit::Violation(violation) => {
                tracing::debug!(code = violation.code, reason = %violation.reason, "WebSocket protocol violation");
                metrics::record_protocol_error("websocket");
                let _ = self
                    .send_frame(&Frame::close(Some(violation.code), &violation.reason))
                    .await;
                self.transport.close().await;
                TerminateReason::Error(violation.reason)
            }
            Exit::Timeout => {
                tracing::debug!("WebSocket idle timeout");
                let _ = self
                    .send_frame(&Frame::close(Some(CloseCode::PROTOCOL_ERROR), ""))
                    .await;
                self.transport.close().await;
                TerminateReason::Timeout
            }
            Exit::Transport(e) => {
                if e.is_peer_closure() && !self.settings.log_client_closures {
                    tracing::debug!(error = %e, "WebSocket peer disconnected");
                } else {
                    tracing::warn!(error = %e, "WebSocket transport error");
                }
                self.transport.close().await;
                TerminateReason::Error(e.to_string())
            }
        }
    }

    /// Discard frames until the peer's close arrives, bounded by `close_timeout`.
    async fn await_peer_close(&mut self) {
        let max = self.settings.max_frame_size;
        let limit = self.settings.close_timeout;
        let transport = &mut *self.transport;
        let wait = async move {
            loop {
                match deserialize_with_limit(transport.buffer(), max) {
                    Ok(Decoded::Frame { frame, consumed }) => {
                        transport.consume(consumed);
                        if frame.opcode == OpCode::Close {
                            return;
                        }
                    }
                    Ok(Decoded::Incomplete) => {
                        if transport.recv(None).await.is_err() {
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
        };
        if tokio::time::timeout(limit, wait).await.is_err() {
            tracing::debug!("Peer did not answer close in time");
        }
    }

    async fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        self.transport.send(&serialize(frame)).await?;
        self.transport.flush().await
    }

    /// Run a handler callback, turning a panic into its message.
    fn call<R>(&mut self, f: impl FnOnce(&mut dyn SocketHandler) -> R) -> Result<R, String> {
        let handler = self.handler.as_mut();
        catch_unwind(AssertUnwindSafe(|| f(handler))).map_err(|payload| panic_message(&*payload))
    }
}

fn handler_panicked(panic: String) -> Exit {
    tracing::error!(panic = %panic, "Socket handler panicked");
    Exit::CloseLocal {
        code: CloseCode::INTERNAL_ERROR,
        reason: String::new(),
        terminate: TerminateReason::Error(format!("handler panicked: {panic}")),
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
