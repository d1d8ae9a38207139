//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use portico::http::{Body, BoxError, Handler, Message, Reply, Request, Response};
use portico::http::{CloseReason, SocketHandler, SocketReply};
use portico::lifecycle::Shutdown;
use portico::net::Listener;
use portico::websocket::frame::{deserialize, serialize_masked, Decoded, Frame};
use portico::websocket::WebSocketUpgrade;
use portico::{HttpServer, ServerConfig};

/// A running server bound to an ephemeral local port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub task: JoinHandle<()>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Trigger shutdown and wait for the accept loop to exit.
    pub async fn stop(self) {
        self.shutdown.trigger();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
    }
}

/// Start `TestApp` with the given configuration.
pub async fn start_server(config: ServerConfig) -> TestServer {
    start_with(config, TestApp).await
}

pub async fn start_with<H: Handler>(config: ServerConfig, handler: H) -> TestServer {
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listener = Listener::from_tcp(tcp, config.listener.max_connections).unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let server = HttpServer::new(config, handler);
    let signal = shutdown.clone();
    let task = tokio::spawn(async move {
        server.run(listener, &signal).await.unwrap();
        server.drain(Duration::from_secs(5)).await;
    });

    TestServer {
        addr,
        shutdown,
        task,
    }
}

/// Application used by the integration tests.
///
/// - `/ws`: WebSocket echo (400 if the handshake is rejected)
/// - `/echo`: echoes the request body
/// - `/large`: a compressible 4 KiB text body
/// - `/stream`: a chunked body of three parts
/// - anything else: `hello <path>`
pub struct TestApp;

impl Handler for TestApp {
    async fn handle_request(&self, request: Request, body: &mut Body<'_>) -> Result<Reply, BoxError> {
        match request.path() {
            "/ws" => match WebSocketUpgrade::new(&request, Echo) {
                Ok(upgrade) => Ok(upgrade.into()),
                Err(e) => Ok(Response::text(400, e.to_string()).into()),
            },
            "/echo" => {
                let data = body.read_all(1024 * 1024).await?;
                Ok(Response::bytes(200, data).into())
            }
            "/large" => Ok(Response::text(200, "portico ".repeat(512)).into()),
            "/stream" => {
                let parts: Vec<Result<Bytes, BoxError>> = vec![
                    Ok(Bytes::from_static(b"one,")),
                    Ok(Bytes::from_static(b"two,")),
                    Ok(Bytes::from_static(b"three")),
                ];
                Ok(Response::stream(200, futures_util::stream::iter(parts)).into())
            }
            path => Ok(Response::text(200, format!("hello {}", path)).into()),
        }
    }
}

/// Echoes data messages; the text message `bye` closes with code 4000.
pub struct Echo;

impl SocketHandler for Echo {
    fn handle(&mut self, message: Message) -> SocketReply {
        match message {
            Message::Text(ref text) if text == "bye" => {
                SocketReply::Stop(Some(CloseReason::new(4000, "bye")))
            }
            Message::Text(_) | Message::Binary(_) => SocketReply::Reply(vec![message]),
            _ => SocketReply::Continue,
        }
    }
}

/// A parsed HTTP response read off a raw socket.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Read one response from `stream`, keeping surplus bytes in `buf` for the
/// next call. Handles content-length, chunked, and bodiless responses.
pub async fn read_response(stream: &mut TcpStream, buf: &mut Vec<u8>) -> RawResponse {
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        fill(stream, buf).await;
    };

    let head = String::from_utf8(buf[..head_end].to_vec()).unwrap();
    buf.drain(..head_end);
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap();
    let status = status_line.split(' ').nth(1).unwrap().parse().unwrap();
    let headers: Vec<(String, String)> = lines
        .filter(|l| !l.is_empty())
        .map(|l| {
            let (n, v) = l.split_once(':').unwrap();
            (n.trim().to_ascii_lowercase(), v.trim().to_string())
        })
        .collect();

    let mut response = RawResponse {
        status,
        headers,
        body: Vec::new(),
    };

    if status == 101 || status == 204 || status == 304 {
        return response;
    }

    if let Some(len) = response.header("content-length") {
        let len: usize = len.parse().unwrap();
        while buf.len() < len {
            fill(stream, buf).await;
        }
        response.body = buf.drain(..len).collect();
    } else if response.header("transfer-encoding") == Some("chunked") {
        loop {
            let line_end = loop {
                if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
                    break pos;
                }
                fill(stream, buf).await;
            };
            let size_line = String::from_utf8(buf[..line_end].to_vec()).unwrap();
            let size = usize::from_str_radix(size_line.split(';').next().unwrap().trim(), 16).unwrap();
            buf.drain(..line_end + 2);
            while buf.len() < size + 2 {
                fill(stream, buf).await;
            }
            response.body.extend(buf.drain(..size));
            buf.drain(..2);
            if size == 0 {
                break;
            }
        }
    } else {
        stream.read_to_end(buf).await.unwrap();
        response.body = std::mem::take(buf);
    }
    response
}

async fn fill(stream: &mut TcpStream, buf: &mut Vec<u8>) {
    let mut chunk = [0u8; 4096];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
        .await
        .expect("timed out waiting for data")
        .unwrap();
    assert!(n > 0, "connection closed early");
    buf.extend_from_slice(&chunk[..n]);
}

/// Wait for the peer to close; returns true on EOF (or reset) within 5s.
pub async fn closed_by_peer(stream: &mut TcpStream) -> bool {
    let mut chunk = [0u8; 1024];
    loop {
        match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk)).await {
            Ok(Ok(0)) | Ok(Err(_)) => return true,
            Ok(Ok(_)) => continue,
            Err(_) => return false,
        }
    }
}

/// Client handshake request for `/ws`.
pub fn upgrade_request(key: &str, extra: &str) -> String {
    format!(
        "GET /ws HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: {}\r\n{}\r\n",
        key, extra
    )
}

/// Send a frame masked with a random key.
pub async fn send_frame(stream: &mut TcpStream, frame: &Frame) {
    let key: [u8; 4] = rand::random();
    stream.write_all(&serialize_masked(frame, key)).await.unwrap();
}

/// Read one server frame.
pub async fn read_frame(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Frame {
    loop {
        if let Decoded::Frame { frame, consumed } = deserialize(buf).unwrap() {
            buf.drain(..consumed);
            return frame;
        }
        fill(stream, buf).await;
    }
}
