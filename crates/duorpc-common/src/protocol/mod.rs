//! DuoRPC Protocol Definitions
//!
//! This module defines the wire-level message types and the error type used
//! throughout the system.
//!
//! # Message Kinds
//!
//! Two message shapes share the same JSON framing:
//!
//! - **[`NegotiationMessage`]**: the two-frame authentication handshake
//!   exchanged before any RPC traffic, always uncompressed
//! - **[`RpcMessage`]**: requests and responses after the handshake,
//!   gzip-compressed when negotiated
//!
//! # Error Handling
//!
//! All fallible operations return [`Result`] with [`DuorpcError`]. A
//! handler-reported failure travels the wire as an error response and is
//! surfaced to the originating caller as
//! [`DuorpcError::Response`]` { code, message }`; it never terminates the
//! connection.

pub mod error;
pub mod message;
pub mod negotiation;

pub use error::{DuorpcError, Result};
pub use message::{MessageType, RpcMessage};
pub use negotiation::NegotiationMessage;
