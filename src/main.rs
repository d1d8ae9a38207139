//! portico demo server.
//!
//! Serves a WebSocket echo endpoint at `/ws`, echoes request bodies at
//! `/echo`, and answers everything else with a short text response.
//!
//! ```text
//! signals ──▶ Shutdown ──▶ HttpServer::run (stop accepting)
//!                      └─▶ connections (close idle keep-alive, 1001 to sockets)
//!                      └─▶ HttpServer::drain (bounded wait)
//! ```

use std::path::PathBuf;

use clap::Parser;

use portico::config::{load_config, validate_config, ServerConfig};
use portico::http::{Body, BoxError, Handler, Message, Reply, Request, Response};
use portico::http::{SocketHandler, SocketReply, TerminateReason};
use portico::lifecycle::{wait_for_signal, Shutdown};
use portico::net::Listener;
use portico::observability::{init_logging, init_metrics};
use portico::websocket::WebSocketUpgrade;
use portico::HttpServer;

#[derive(Parser)]
#[command(name = "portico")]
#[command(about = "Embeddable HTTP/1.x and WebSocket server (demo binary)", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listener bind address.
    #[arg(short, long)]
    bind: Option<String>,

    /// Print the effective configuration as JSON and exit.
    #[arg(long)]
    dump_config: bool,
}

/// Demo application.
struct Demo;

impl Handler for Demo {
    async fn handle_request(&self, request: Request, body: &mut Body<'_>) -> Result<Reply, BoxError> {
        match request.path() {
            "/ws" => Ok(WebSocketUpgrade::new(&request, EchoSocket::default())?.into()),
            "/echo" => {
                let data = body.read_all(1024 * 1024).await?;
                Ok(Response::bytes(200, data)
                    .with_header("content-type", "application/octet-stream")
                    .into())
            }
            path => Ok(Response::text(200, format!("portico: {} {}\n", request.method, path)).into()),
        }
    }
}

/// Echoes every data message back to the sender.
#[derive(Default)]
struct EchoSocket {
    messages: u64,
}

impl SocketHandler for EchoSocket {
    fn handle(&mut self, message: Message) -> SocketReply {
        match message {
            Message::Text(_) | Message::Binary(_) => {
                self.messages += 1;
                SocketReply::Reply(vec![message])
            }
            Message::Ping(_) | Message::Pong(_) => SocketReply::Continue,
        }
    }

    fn terminate(&mut self, reason: &TerminateReason) {
        tracing::debug!(messages = self.messages, reason = reason.label(), "Echo socket finished");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
        validate_config(&config).map_err(|errors| {
            errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        })?;
    }

    if cli.dump_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    init_logging(&config.observability)?;
    tracing::info!("portico v{} starting", env!("CARGO_PKG_VERSION"));

    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        websocket_enabled = config.websocket.enabled,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        let addr: std::net::SocketAddr = config.observability.metrics_address.parse()?;
        init_metrics(addr)?;
        tracing::info!(address = %addr, "Metrics endpoint listening");
    }

    let listener = Listener::bind(&config.listener).await?;
    let drain_timeout = config.timeouts.shutdown_drain();
    let server = HttpServer::new(config, Demo);
    let shutdown = Shutdown::new();

    let signals = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            shutdown.trigger();
        })
    };

    server.run(listener, &shutdown).await?;
    signals.abort();

    server.drain(drain_timeout).await;
    tracing::info!("Shutdown complete");
    Ok(())
}
