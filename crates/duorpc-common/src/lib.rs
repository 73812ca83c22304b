//! DuoRPC Common
//!
//! This crate provides the protocol definitions, frame codec, and the
//! bidirectional connection core shared by the DuoRPC server and client.
//!
//! # Overview
//!
//! DuoRPC multiplexes request/response messages in both directions over a
//! single long-lived, authenticated, optionally compressed byte stream
//! (TCP or TLS-over-TCP). Once the handshake completes, both endpoints are
//! symmetric: either side may invoke methods registered by its peer, and
//! many calls may be in flight concurrently on the same stream.
//!
//! # Components
//!
//! - [`protocol`] - Message types ([`RpcMessage`], [`NegotiationMessage`])
//!   and the [`DuorpcError`] error type
//! - [`transport`] - Length-prefixed JSON framing with optional gzip
//!   compression, plus the TCP/TLS dialer
//! - [`connection`] - The [`Connection`]: handshake helpers, read loop,
//!   serialized send path, pending-call table, and call primitives
//! - [`handler`] - The [`HandlerRegistry`] mapping method names to async
//!   handlers
//! - [`context`] - The handler-facing [`Context`] with typed parameter
//!   accessors and response emission
//! - [`convert`] - Conversion from dynamic JSON results into typed values
//!
//! # Example
//!
//! ```no_run
//! use duorpc_common::{Connection, HandlerRegistry};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use serde_json::json;
//!
//! # async fn example(stream: tokio::net::TcpStream) -> duorpc_common::Result<()> {
//! let handlers = Arc::new(HandlerRegistry::new());
//! handlers.register("Echo", |ctx| async move {
//!     let msg = ctx.param_string("msg", "");
//!     let _ = ctx.respond(msg).await;
//! });
//!
//! let conn = Arc::new(Connection::new(stream, handlers));
//! // ... handshake, then:
//! let reply = conn.call("Echo", json!({"msg": "ping"}), Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod context;
pub mod convert;
pub mod handler;
pub mod protocol;
pub mod transport;

pub use connection::{CallHandle, Connection};
pub use context::Context;
pub use convert::decode_value;
pub use handler::{HandlerFn, HandlerRegistry};
pub use protocol::{DuorpcError, MessageType, NegotiationMessage, Result, RpcMessage};
pub use transport::{Dialer, TlsClientConfig};
