//! End-to-end HTTP tests against a live server.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use portico::ServerConfig;

mod common;

use common::{closed_by_peer, read_response, start_server};

#[tokio::test]
async fn test_pipelined_requests_answered_in_order() {
    let server = start_server(ServerConfig::default()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    stream
        .write_all(
            b"GET /first HTTP/1.1\r\nHost: localhost\r\n\r\n\
              GET /second HTTP/1.1\r\nHost: localhost\r\n\r\n",
        )
        .await
        .unwrap();

    let mut buf = Vec::new();
    let first = read_response(&mut stream, &mut buf).await;
    let second = read_response(&mut stream, &mut buf).await;

    assert_eq!(first.status, 200);
    assert_eq!(first.body, b"hello /first");
    assert_eq!(first.header("content-length"), Some("12"));
    assert!(first.header("date").is_some());
    assert!(first.header("x-request-id").is_some());
    assert_eq!(second.body, b"hello /second");
    assert_ne!(first.header("x-request-id"), second.header("x-request-id"));

    server.stop().await;
}

#[tokio::test]
async fn test_client_request_id_is_echoed() {
    let server = start_server(ServerConfig::default()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nX-Request-Id: abc-123\r\n\r\n")
        .await
        .unwrap();
    let mut buf = Vec::new();
    let response = read_response(&mut stream, &mut buf).await;
    assert_eq!(response.header("x-request-id"), Some("abc-123"));

    server.stop().await;
}

#[tokio::test]
async fn test_max_requests_closes_connection() {
    let mut config = ServerConfig::default();
    config.http.max_requests = 2;
    let server = start_server(config).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let request = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
    let mut buf = Vec::new();

    stream.write_all(request).await.unwrap();
    let first = read_response(&mut stream, &mut buf).await;
    assert_ne!(first.header("connection"), Some("close"));

    stream.write_all(request).await.unwrap();
    let second = read_response(&mut stream, &mut buf).await;
    assert_eq!(second.header("connection"), Some("close"));
    assert!(closed_by_peer(&mut stream).await);

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_request_gets_400() {
    let server = start_server(ServerConfig::default()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    stream.write_all(b"NOT A REQUEST\r\n\r\n").await.unwrap();
    let mut buf = Vec::new();
    let response = read_response(&mut stream, &mut buf).await;
    assert_eq!(response.status, 400);
    assert!(closed_by_peer(&mut stream).await);

    server.stop().await;
}

#[tokio::test]
async fn test_oversized_request_line_rejected() {
    let mut config = ServerConfig::default();
    config.http.max_request_line_length = 64;
    let server = start_server(config).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let request = format!("GET /{} HTTP/1.1\r\nHost: localhost\r\n\r\n", "a".repeat(200));
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    let response = read_response(&mut stream, &mut buf).await;
    assert_eq!(response.status, 414);

    server.stop().await;
}

#[tokio::test]
async fn test_chunked_response_stream() {
    let server = start_server(ServerConfig::default()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    stream
        .write_all(b"GET /stream HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut buf = Vec::new();
    let response = read_response(&mut stream, &mut buf).await;
    assert_eq!(response.header("transfer-encoding"), Some("chunked"));
    assert!(response.header("content-length").is_none());
    assert_eq!(response.body, b"one,two,three");

    server.stop().await;
}

#[tokio::test]
async fn test_chunked_request_echo() {
    let server = start_server(ServerConfig::default()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    stream
        .write_all(
            b"POST /echo HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        )
        .await
        .unwrap();
    let mut buf = Vec::new();
    let response = read_response(&mut stream, &mut buf).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"hello world");

    server.stop().await;
}

#[tokio::test]
async fn test_head_request_has_no_body() {
    let server = start_server(ServerConfig::default()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    stream
        .write_all(b"HEAD /x HTTP/1.1\r\nHost: localhost\r\n\r\nGET /y HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    // The HEAD response advertises a length but carries no bytes, so the
    // next response must start immediately after its head.
    let mut buf = Vec::new();
    let head = read_response_headers_only(&mut stream, &mut buf).await;
    assert!(head.starts_with("HTTP/1.1 200"));
    let next = read_response(&mut stream, &mut buf).await;
    assert_eq!(next.body, b"hello /y");

    server.stop().await;
}

async fn read_response_headers_only(stream: &mut TcpStream, buf: &mut Vec<u8>) -> String {
    use tokio::io::AsyncReadExt;
    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8(buf[..pos + 4].to_vec()).unwrap();
            buf.drain(..pos + 4);
            return head;
        }
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0);
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[tokio::test]
async fn test_reqwest_get_and_post() {
    let server = start_server(ServerConfig::default()).await;
    let client = reqwest::Client::new();

    let response = client.get(server.url("/hello")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "hello /hello");

    let response = client
        .post(server.url("/echo"))
        .body("payload")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "payload");

    server.stop().await;
}

#[tokio::test]
async fn test_gzip_compression_negotiated() {
    let server = start_server(ServerConfig::default()).await;
    let client = reqwest::Client::new();

    let response = client
        .get(server.url("/large"))
        .header("accept-encoding", "gzip")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-encoding").unwrap(),
        "gzip"
    );
    assert!(response
        .headers()
        .get("vary")
        .unwrap()
        .to_str()
        .unwrap()
        .contains("accept-encoding"));

    let compressed = response.bytes().await.unwrap();
    let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
    let mut text = String::new();
    std::io::Read::read_to_string(&mut decoder, &mut text).unwrap();
    assert_eq!(text, "portico ".repeat(512));

    server.stop().await;
}

#[tokio::test]
async fn test_small_body_not_compressed() {
    let server = start_server(ServerConfig::default()).await;
    let client = reqwest::Client::new();

    let response = client
        .get(server.url("/tiny"))
        .header("accept-encoding", "gzip")
        .send()
        .await
        .unwrap();
    assert!(response.headers().get("content-encoding").is_none());
    assert_eq!(response.text().await.unwrap(), "hello /tiny");

    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let server = start_server(ServerConfig::default()).await;
    let addr = server.addr;

    let mut idle = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.stop().await;

    assert!(closed_by_peer(&mut idle).await);
    assert!(TcpStream::connect(addr).await.is_err());
}
