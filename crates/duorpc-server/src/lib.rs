//! DuoRPC Server
//!
//! This crate provides the server side of the DuoRPC runtime: it accepts
//! connections (plain TCP or TLS), authenticates each peer through an
//! embedder-supplied predicate, keeps a registry of connected clients with
//! heartbeat-based liveness, and routes server-initiated calls by client
//! id.
//!
//! # Architecture
//!
//! The server is responsible for:
//! - Accepting connections and driving the server-side handshake
//! - Registering authenticated peers by id and evicting stale ones
//! - Answering the built-in `Ping` heartbeat
//! - Routing outbound calls (`call`, `call_with_result`, `call_async`,
//!   `call_async_with_result`) to the right client connection
//!
//! Once a connection is established it is fully symmetric: clients invoke
//! server handlers and the server invokes client handlers over the same
//! stream.
//!
//! # Example
//!
//! ```no_run
//! use duorpc_server::Server;
//!
//! # #[tokio::main]
//! # async fn main() -> duorpc_common::Result<()> {
//! let server = Server::new(|client_id, auth_code| {
//!     client_id == "agent-1" && auth_code == "s3cr3t"
//! });
//!
//! server.register_handler("Echo", |ctx| async move {
//!     let msg = ctx.param_string("msg", "");
//!     let _ = ctx.respond(msg).await;
//! });
//!
//! server.serve("0.0.0.0:9443").await
//! # }
//! ```

pub mod server;
pub mod tls;

pub use server::{Server, DEFAULT_HEARTBEAT_TIMEOUT};
pub use tls::TlsServerConfig;
