//! DuoRPC Client
//!
//! This crate provides [`AutoClient`], the connecting side of the DuoRPC
//! runtime. It dials the server (plain TCP, or TLS with an ALPN token),
//! drives the authentication handshake, and keeps exactly one live
//! connection in an atomic slot, reconnecting with exponential backoff
//! whenever the connection is lost.
//!
//! # Reconnect Behavior
//!
//! After the initial connection succeeds, a background task watches the
//! current connection. When it closes, the client redials with delays of
//! 2s, 4s, 8s, ... capped at 3 minutes, resetting after each success.
//! In-flight calls are never resumed across a reconnect: they fail with a
//! disconnection error and callers retry at their own layer.
//!
//! # Heartbeat
//!
//! By default each established connection pings the server every 30
//! seconds so the server's liveness tracking keeps the client registered.
//! Embedders that ping themselves can disable this with
//! [`AutoClient::without_heartbeat`].
//!
//! # Example
//!
//! ```no_run
//! use duorpc_client::AutoClient;
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> duorpc_common::Result<()> {
//! let client = AutoClient::new("127.0.0.1:9443", "agent-1", "s3cr3t").with_compression(true);
//! client.register_handler("Refresh", |ctx| async move {
//!     let _ = ctx.respond("done").await;
//! });
//! client.start().await?;
//!
//! let reply = client
//!     .call("Echo", json!({"msg": "ping"}), Duration::from_secs(5))
//!     .await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

pub mod client;

pub use client::AutoClient;
