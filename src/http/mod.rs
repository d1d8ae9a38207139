//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Transport (one per connection)
//!     → connection.rs (keep-alive loop, timeouts, dispatch)
//!         → parse.rs (request line + header block)
//!         → request.rs (target, host, body framing, request ID)
//!         → body.rs (content-length / chunked reader, 100-continue)
//!         → handler.rs (application callback)
//!         → response.rs + compress.rs (framing, compression, wire bytes)
//!     → server.rs (accept loop spawning connection tasks)
//! ```

pub mod body;
pub mod compress;
pub mod connection;
pub mod handler;
pub mod header;
pub mod parse;
pub mod request;
pub mod response;
pub mod server;
pub mod status;

pub use body::{Body, BodyError, ReadResult};
pub use connection::{ConnectionEnd, ConnectionSettings, HttpConnection};
pub use handler::{
    BoxError, CloseReason, Handler, Message, Reply, SocketHandler, SocketReply, TerminateReason,
};
pub use header::HeaderMap;
pub use parse::{ParseError, Version};
pub use request::{BodyFraming, Request, Target, X_REQUEST_ID};
pub use response::{Response, ResponseBody};
pub use server::HttpServer;
