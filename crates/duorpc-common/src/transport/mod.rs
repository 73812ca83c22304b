//! DuoRPC Transport Layer
//!
//! This module provides the frame codec and the outbound dialer.
//!
//! # Wire Format
//!
//! Every frame is sent with a 4-byte length prefix (big-endian u32)
//! followed by the payload:
//!
//! ```text
//! [4-byte length] [payload]
//! ```
//!
//! Negotiation frames always carry plain JSON. Once a connection has
//! negotiated compression, the payload of every subsequent RPC frame is a
//! complete gzip stream whose decompressed bytes are the JSON object, so
//! each frame is decodable the moment it arrives. Because the reader
//! consumes exactly the prefixed number of bytes, no buffered bytes can
//! leak across the plaintext-to-compressed transition after `auth_ok`.
//!
//! # Message Size Limits
//!
//! Frames are capped at 100 MB to prevent memory exhaustion from a
//! malformed or hostile peer.

pub mod dialer;
pub mod frame;

pub use dialer::{ensure_crypto_provider, BoxedTransport, Dialer, TlsClientConfig, Transport};
pub use frame::{FrameReader, FrameWriter, MAX_FRAME_SIZE};
