//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define server metrics (connections, requests, latency, protocol errors)
//! - Record them through the `metrics` facade
//! - Install a Prometheus-compatible scrape endpoint
//!
//! # Metrics
//! - `portico_connections_total` (counter): accepted connections
//! - `portico_active_connections` (gauge): current connection count
//! - `portico_http_requests_total` (counter): responses by status
//! - `portico_http_request_duration_seconds` (histogram): dispatch-to-written latency
//! - `portico_protocol_errors_total` (counter): parse/framing failures by kind
//! - `portico_websocket_messages_total` (counter): messages by direction
//! - `portico_websocket_closes_total` (counter): terminated sockets by reason
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so the library can be
//!   embedded without an exporter

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

pub const CONNECTIONS_TOTAL: &str = "portico_connections_total";
pub const ACTIVE_CONNECTIONS: &str = "portico_active_connections";
pub const HTTP_REQUESTS_TOTAL: &str = "portico_http_requests_total";
pub const HTTP_REQUEST_DURATION: &str = "portico_http_request_duration_seconds";
pub const PROTOCOL_ERRORS_TOTAL: &str = "portico_protocol_errors_total";
pub const WEBSOCKET_MESSAGES_TOTAL: &str = "portico_websocket_messages_total";
pub const WEBSOCKET_CLOSES_TOTAL: &str = "portico_websocket_closes_total";

/// Install the Prometheus recorder and its HTTP scrape listener.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(address: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
}

pub fn record_connection_opened() {
    counter!(CONNECTIONS_TOTAL).increment(1);
    gauge!(ACTIVE_CONNECTIONS).increment(1.0);
}

pub fn record_connection_closed() {
    gauge!(ACTIVE_CONNECTIONS).decrement(1.0);
}

/// Record one written response.
pub fn record_request(method: &str, status: u16, start: Instant) {
    counter!(HTTP_REQUESTS_TOTAL, "method" => method.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(HTTP_REQUEST_DURATION).record(start.elapsed().as_secs_f64());
}

pub fn record_protocol_error(kind: &'static str) {
    counter!(PROTOCOL_ERRORS_TOTAL, "kind" => kind).increment(1);
}

pub fn record_websocket_message(direction: &'static str) {
    counter!(WEBSOCKET_MESSAGES_TOTAL, "direction" => direction).increment(1);
}

pub fn record_websocket_close(reason: &'static str) {
    counter!(WEBSOCKET_CLOSES_TOTAL, "reason" => reason).increment(1);
}
