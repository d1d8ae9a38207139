//! HTTP/1.x keep-alive connection loop.
//!
//! # Responsibilities
//! - Read request heads with idle and request timeouts
//! - Dispatch each request to the [`Handler`] behind a single panic boundary
//! - Write the response, drain any unread body and decide whether to keep going
//! - Hand the transport to the WebSocket loop on `Reply::Upgrade`
//!
//! # Data Flow
//! ```text
//! Idle ──head bytes──▶ ReadRequest ──parsed──▶ Dispatch ──reply──▶ WriteResponse
//!   ▲                      │ timeout/parse error → 408/4xx/5xx, Closing      │
//!   └──────── drain body, keep-alive ◀─────────────────────────────────────┘
//!                                                    └─ upgrade ──▶ WebSocket loop
//! ```
//!
//! # Design Decisions
//! - Requests on one connection are strictly sequential; pipelined bytes wait
//!   in the transport buffer
//! - Any handler failure closes the connection, even when a response went out
//! - An idle timeout with nothing buffered closes silently; a partial head
//!   that stalls is answered with 408

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;

use crate::config::ServerConfig;
use crate::http::body::{Body, BodyError, BodyState};
use crate::http::handler::{Handler, Reply, TerminateReason};
use crate::http::parse::{parse_head, ParseError, ParseLimits, ParseStatus, RequestHead, Version};
use crate::http::request::{BodyFraming, Request, X_REQUEST_ID};
use crate::http::response::{Response, ResponseContext, ResponseWriter, WriteSettings};
use crate::lifecycle::shutdown::ShutdownSignal;
use crate::net::transport::{Transport, TransportError};
use crate::observability::metrics;
use crate::websocket::connection::{panic_message, WebSocketConnection, WsSettings};

/// Per-connection settings derived from the server configuration.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub limits: ParseLimits,
    pub write: WriteSettings,
    pub websocket: WsSettings,
    pub websocket_enabled: bool,
    pub websocket_compress: bool,
    /// Requests per connection (0 = unlimited).
    pub max_requests: u64,
    /// Most bytes drained from a body the handler did not read.
    pub max_body_size: u64,
    /// Between requests and per body read.
    pub idle_timeout: Duration,
    /// To receive a full request head once its first byte arrived.
    pub request_timeout: Duration,
    pub log_client_closures: bool,
    pub log_protocol_errors: bool,
}

impl ConnectionSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        let http = &config.http;
        let timeouts = &config.timeouts;
        Self {
            limits: ParseLimits {
                max_request_line_length: http.max_request_line_length,
                max_header_length: http.max_header_length,
                max_header_count: http.max_header_count,
            },
            write: WriteSettings {
                compress: http.compress,
                compress_threshold: http.compress_threshold,
                compress_strong_etag: http.compress_strong_etag,
            },
            websocket: WsSettings {
                max_frame_size: config.websocket.max_frame_size,
                validate_utf8: config.websocket.validate_utf8,
                idle_timeout: Some(timeouts.websocket_idle()),
                close_timeout: timeouts.websocket_close(),
                log_client_closures: config.observability.log_client_closures,
            },
            websocket_enabled: config.websocket.enabled,
            websocket_compress: config.websocket.compress,
            max_requests: http.max_requests,
            max_body_size: http.max_body_size,
            idle_timeout: timeouts.idle(),
            request_timeout: timeouts.request(),
            log_client_closures: config.observability.log_client_closures,
            log_protocol_errors: config.observability.log_protocol_errors,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// Closed after serving this many requests.
    Closed { requests: u64 },
    /// Switched to WebSocket; carries the socket's termination reason.
    Upgraded(TerminateReason),
}

/// Why no request head was produced.
enum HeadError {
    Parse(ParseError),
    /// The head started arriving but did not complete in time.
    Timeout,
}

/// One HTTP connection, owned by its task.
pub struct HttpConnection<H> {
    transport: Transport,
    handler: Arc<H>,
    settings: Arc<ConnectionSettings>,
    served: u64,
}

impl<H: Handler> HttpConnection<H> {
    pub fn new(transport: Transport, handler: Arc<H>, settings: Arc<ConnectionSettings>) -> Self {
        Self {
            transport,
            handler,
            settings,
            served: 0,
        }
    }

    /// Serve requests until the connection closes or is upgraded.
    pub async fn run(mut self, shutdown: &mut ShutdownSignal) -> ConnectionEnd {
        let end = self.serve(shutdown).await;
        if let ConnectionEnd::Closed { .. } = end {
            self.transport.close().await;
        }
        let (received, sent) = self.transport.counters();
        tracing::debug!(
            requests = self.served,
            bytes_received = received,
            bytes_sent = sent,
            "Connection finished"
        );
        end
    }

    async fn serve(&mut self, shutdown: &mut ShutdownSignal) -> ConnectionEnd {
        loop {
            if shutdown.is_triggered() {
                break;
            }

            let head = match self.read_head(shutdown).await {
                Ok(Some(head)) => head,
                Ok(None) => break,
                Err(HeadError::Timeout) => {
                    tracing::debug!("Timed out reading request head");
                    metrics::record_protocol_error("request_timeout");
                    self.write_error(408).await;
                    break;
                }
                Err(HeadError::Parse(e)) => {
                    self.protocol_error(&e);
                    self.write_error(e.status()).await;
                    break;
                }
            };

            let info = *self.transport.info();
            let mut request = match Request::from_head(head, &info) {
                Ok(request) => request,
                Err(e) => {
                    self.protocol_error(&e);
                    self.write_error(e.status()).await;
                    break;
                }
            };
            request.websocket_enabled = self.settings.websocket_enabled;
            self.served += 1;

            match self.dispatch(request, shutdown).await {
                Step::Continue => {}
                Step::Close => break,
                Step::Upgraded(reason) => return ConnectionEnd::Upgraded(reason),
            }
        }
        ConnectionEnd::Closed {
            requests: self.served,
        }
    }

    /// Wait for and parse the next request head.
    ///
    /// `Ok(None)` means the connection should close quietly: idle timeout,
    /// shutdown between requests or the peer going away.
    async fn read_head(
        &mut self,
        shutdown: &mut ShutdownSignal,
    ) -> Result<Option<RequestHead>, HeadError> {
        let mut started: Option<Instant> = None;
        loop {
            if self.transport.has_buffered() {
                match parse_head(self.transport.buffer(), &self.settings.limits)
                    .map_err(HeadError::Parse)?
                {
                    ParseStatus::Complete { head, consumed } => {
                        self.transport.consume(consumed);
                        return Ok(Some(head));
                    }
                    ParseStatus::Partial => {
                        started.get_or_insert_with(Instant::now);
                    }
                }
            }

            let read = match started {
                Some(start) => {
                    let left = self.settings.request_timeout.saturating_sub(start.elapsed());
                    self.transport.recv(Some(left)).await
                }
                None => {
                    let idle = Some(self.settings.idle_timeout);
                    tokio::select! {
                        read = self.transport.recv(idle) => read,
                        _ = shutdown.wait() => return Ok(None),
                    }
                }
            };

            match read {
                Ok(_) => {}
                Err(TransportError::Timeout(_)) if started.is_some() => {
                    return Err(HeadError::Timeout)
                }
                Err(TransportError::Timeout(_)) => {
                    tracing::trace!("Idle timeout between requests");
                    return Ok(None);
                }
                Err(e) => {
                    if started.is_some() || !e.is_peer_closure() {
                        self.transport_error(&e);
                    }
                    return Ok(None);
                }
            }
        }
    }

    async fn dispatch(&mut self, request: Request, shutdown: &mut ShutdownSignal) -> Step {
        let start = Instant::now();
        let last = self.settings.max_requests > 0 && self.served >= self.settings.max_requests;
        let mut ctx = ResponseContext {
            is_head: request.is_head(),
            version: request.version,
            accept_encoding: request
                .headers
                .get_all("accept-encoding")
                .map(str::to_string)
                .collect(),
            keep_alive: request.wants_keep_alive() && !last,
        };
        let request_id = request.id;
        let method = request.method.clone();
        let path = request.target.path.clone();
        tracing::debug!(request_id = %request_id, method = %method, path = %path, "Request received");

        let framing = request.framing;
        let handler = Arc::clone(&self.handler);
        let mut body = Body::new(
            &mut self.transport,
            framing,
            Some(self.settings.idle_timeout),
            request.expects_continue(),
        );
        let result = AssertUnwindSafe(handler.handle_request(request, &mut body))
            .catch_unwind()
            .await;
        let (body_state, continue_pending) = body.into_parts();

        let mut failed = false;
        let response = match result {
            Ok(Ok(Reply::Response(response))) => response,
            Ok(Ok(Reply::Upgrade(upgrade))) => {
                let body_left = !body_complete(body_state);
                if body_left && !self.drain(body_state).await {
                    return Step::Close;
                }
                let (response, deflate, socket) = upgrade.into_parts(self.settings.websocket_compress);
                let upgrade_ctx = ResponseContext {
                    is_head: false,
                    version: Version::Http11,
                    accept_encoding: Vec::new(),
                    keep_alive: true,
                };
                let response = response.with_header(X_REQUEST_ID, request_id.to_string());
                let mut writer = ResponseWriter::new(&mut self.transport, self.settings.write);
                if let Err(e) = writer.write(response, &upgrade_ctx).await {
                    tracing::debug!(request_id = %request_id, error = %e, "Failed to write upgrade response");
                    return Step::Close;
                }
                metrics::record_request(&method, 101, start);
                tracing::debug!(request_id = %request_id, path = %path, "Connection upgraded to WebSocket");

                let reason = WebSocketConnection::new(
                    &mut self.transport,
                    socket,
                    deflate,
                    self.settings.websocket,
                )
                .run(shutdown)
                .await;
                return Step::Upgraded(reason);
            }
            Ok(Err(e)) => {
                failed = true;
                match e.downcast_ref::<BodyError>() {
                    Some(body_err) => match body_err.status() {
                        Some(status) => {
                            tracing::debug!(request_id = %request_id, error = %body_err, "Request body rejected");
                            Response::new(status)
                        }
                        None => {
                            tracing::debug!(request_id = %request_id, error = %body_err, "Request body read failed");
                            return Step::Close;
                        }
                    },
                    None => {
                        tracing::error!(request_id = %request_id, error = %e, "Handler failed");
                        Response::new(500)
                    }
                }
            }
            Err(panic) => {
                failed = true;
                tracing::error!(
                    request_id = %request_id,
                    panic = %panic_message(&*panic),
                    "Handler panicked"
                );
                Response::new(500)
            }
        };

        let body_left = !body_complete(body_state);
        if failed || (continue_pending && body_left) {
            ctx.keep_alive = false;
        }

        let mut response = response;
        if !response.headers().contains(X_REQUEST_ID) {
            response
                .headers_mut()
                .insert(X_REQUEST_ID, request_id.to_string());
        }

        let mut writer = ResponseWriter::new(&mut self.transport, self.settings.write);
        let outcome = match writer.write(response, &ctx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if !writer.headers_sent() {
                    tracing::error!(request_id = %request_id, error = %e, "Failed to prepare response");
                    let _ = writer
                        .write(Response::new(500), &ResponseContext::closing())
                        .await;
                    metrics::record_request(&method, 500, start);
                } else {
                    tracing::warn!(request_id = %request_id, error = %e, "Response aborted");
                }
                return Step::Close;
            }
        };
        metrics::record_request(&method, outcome.status, start);
        tracing::debug!(
            request_id = %request_id,
            method = %method,
            path = %path,
            status = outcome.status,
            body_bytes = outcome.body_bytes,
            "Request completed"
        );

        if !outcome.keep_alive || failed {
            return Step::Close;
        }
        if body_left && !self.drain(body_state).await {
            return Step::Close;
        }
        Step::Continue
    }

    /// Discard the unread rest of a request body. `false` means the
    /// connection cannot be reused.
    async fn drain(&mut self, state: BodyState) -> bool {
        let mut body = Body::from_parts(
            &mut self.transport,
            state,
            Some(self.settings.idle_timeout),
            false,
        );
        match body.drain(self.settings.max_body_size).await {
            Ok(discarded) => {
                tracing::trace!(discarded, "Drained unread request body");
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "Could not drain request body");
                false
            }
        }
    }

    async fn write_error(&mut self, status: u16) {
        let mut writer = ResponseWriter::new(&mut self.transport, self.settings.write);
        if let Err(e) = writer
            .write(Response::new(status), &ResponseContext::closing())
            .await
        {
            tracing::debug!(status, error = %e, "Failed to write error response");
        }
    }

    fn protocol_error(&self, err: &ParseError) {
        metrics::record_protocol_error(err.kind());
        if self.settings.log_protocol_errors {
            tracing::warn!(error = %err, status = err.status(), "Malformed request");
        } else {
            tracing::debug!(error = %err, status = err.status(), "Malformed request");
        }
    }

    fn transport_error(&self, err: &TransportError) {
        if err.is_peer_closure() && !self.settings.log_client_closures {
            tracing::debug!(error = %err, "Client closed connection");
        } else {
            tracing::warn!(error = %err, "Connection error");
        }
    }
}

enum Step {
    Continue,
    Close,
    Upgraded(TerminateReason),
}

fn body_complete(state: BodyState) -> bool {
    matches!(
        state,
        BodyState::Complete | BodyState::NotStarted(BodyFraming::Empty)
    )
}
