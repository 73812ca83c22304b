//! Handshake negotiation messages.

use serde::{Deserialize, Serialize};

use super::MessageType;

/// The message exchanged during the initial handshake, before the stream
/// transitions to (optionally compressed) RPC frames.
///
/// Negotiation frames reuse the JSON framing of RPC frames but are never
/// compressed.
///
/// # Wire Format
///
/// ```json
/// {"type":"auth_request","clientID":"...","authCode":"...","useCompression":true}
/// {"type":"auth_ok","useCompression":true}
/// {"type":"auth_fail"}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NegotiationMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Embedder-chosen identity, sent by the client
    #[serde(rename = "clientID", default, skip_serializing_if = "String::is_empty")]
    pub client_id: String,
    /// Shared credential, sent by the client
    #[serde(rename = "authCode", default, skip_serializing_if = "String::is_empty")]
    pub auth_code: String,
    /// Requests (client) or confirms (server) gzip compression of RPC frames
    #[serde(rename = "useCompression", default, skip_serializing_if = "std::ops::Not::not")]
    pub use_compression: bool,
}

impl NegotiationMessage {
    /// Creates the client's opening handshake frame.
    pub fn auth_request(
        client_id: impl Into<String>,
        auth_code: impl Into<String>,
        use_compression: bool,
    ) -> Self {
        NegotiationMessage {
            kind: MessageType::AuthRequest,
            client_id: client_id.into(),
            auth_code: auth_code.into(),
            use_compression,
        }
    }

    /// Creates the server's acceptance frame, confirming the compression mode.
    pub fn auth_ok(use_compression: bool) -> Self {
        NegotiationMessage {
            kind: MessageType::AuthOk,
            client_id: String::new(),
            auth_code: String::new(),
            use_compression,
        }
    }

    /// Creates the server's rejection frame.
    pub fn auth_fail() -> Self {
        NegotiationMessage {
            kind: MessageType::AuthFail,
            client_id: String::new(),
            auth_code: String::new(),
            use_compression: false,
        }
    }
}
