//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files, and
//! every section defaults so a minimal (or empty) file is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the server.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, connection limit).
    pub listener: ListenerConfig,

    /// HTTP parsing limits and response options.
    pub http: HttpConfig,

    /// WebSocket engine options.
    pub websocket: WebSocketConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
        }
    }
}

/// HTTP/1.x limits and response options.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub max_request_line_length: usize,
    pub max_header_length: usize,
    pub max_header_count: usize,

    /// Requests served per connection before it is closed (0 = unlimited).
    pub max_requests: u64,

    /// Compress eligible responses with gzip/deflate.
    pub compress: bool,

    /// Smallest full body worth compressing, in bytes.
    pub compress_threshold: usize,

    /// Compress responses carrying a strong ETag.
    pub compress_strong_etag: bool,

    /// Upper bound for buffered request bodies and for draining unread ones.
    pub max_body_size: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_request_line_length: 10_000,
            max_header_length: 10_000,
            max_header_count: 50,
            max_requests: 0,
            compress: true,
            compress_threshold: 300,
            compress_strong_etag: false,
            max_body_size: 8 * 1024 * 1024,
        }
    }
}

/// WebSocket engine options.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Accept upgrade requests at all.
    pub enabled: bool,

    /// Largest frame payload and reassembled message (0 = unlimited).
    pub max_frame_size: u64,

    /// Negotiate permessage-deflate when offered.
    pub compress: bool,

    /// Reject text messages that are not UTF-8.
    pub validate_utf8: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_frame_size: 16 * 1024 * 1024,
            compress: true,
            validate_utf8: true,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Idle time allowed between requests and per body read, in milliseconds.
    pub idle_ms: u64,

    /// Time allowed to receive a complete request head, in milliseconds.
    pub request_ms: u64,

    /// Idle time allowed on a WebSocket, in milliseconds.
    pub websocket_idle_ms: u64,

    /// Time to wait for the peer's close frame, in milliseconds.
    pub websocket_close_ms: u64,

    /// Grace period for live connections on shutdown, in seconds.
    pub shutdown_drain_secs: u64,
}

impl TimeoutConfig {
    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn websocket_idle(&self) -> Duration {
        Duration::from_millis(self.websocket_idle_ms)
    }

    pub fn websocket_close(&self) -> Duration {
        Duration::from_millis(self.websocket_close_ms)
    }

    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_secs(self.shutdown_drain_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            idle_ms: 60_000,
            request_ms: 30_000,
            websocket_idle_ms: 60_000,
            websocket_close_ms: 5_000,
            shutdown_drain_secs: 30,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format ("pretty" or "json").
    pub log_format: String,

    /// Log peer disconnects at `warn` instead of `debug`.
    pub log_client_closures: bool,

    /// Log malformed requests at `warn` instead of `debug`.
    pub log_protocol_errors: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            log_client_closures: false,
            log_protocol_errors: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
