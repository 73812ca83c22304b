//! RPC message types.
//!
//! One [`RpcMessage`] is one frame on the wire. Requests carry `method` and
//! `params`; responses carry `result` or `error` + `errorCode`, correlated
//! to the request by `id`. A message with `error` present is an error
//! response regardless of what `result` holds.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name of the RPC method to call.
pub type MethodName = String;

/// RPC method parameters: a mapping from parameter name to JSON value.
pub type RpcParams = Map<String, Value>;

/// Discriminates the message shapes that share the JSON framing.
///
/// `AuthRequest`, `AuthOk` and `AuthFail` appear only in negotiation
/// frames; `Request` and `Response` only after a successful handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    AuthRequest,
    AuthOk,
    AuthFail,
    Request,
    Response,
}

/// An RPC request or response frame.
///
/// # Wire Format
///
/// ```json
/// {"type":"request","id":"...","method":"...","params":{...}}
/// {"type":"response","id":"...","result":...}
/// {"type":"response","id":"...","error":"...","errorCode":44}
/// ```
///
/// Absent optional fields are omitted on encode; unknown fields are ignored
/// on decode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcMessage {
    /// Message kind (`request` or `response` for RPC frames)
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Correlation id pairing a request with its response
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Method name (requests only)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: MethodName,
    /// Method parameters (requests only)
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: RpcParams,
    /// Successful result (responses only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Handler-reported error message (error responses only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Handler-reported error code (error responses only)
    #[serde(rename = "errorCode", default, skip_serializing_if = "is_zero")]
    pub error_code: i32,
}

fn is_zero(code: &i32) -> bool {
    *code == 0
}

impl RpcMessage {
    /// Creates a request frame.
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: RpcParams) -> Self {
        RpcMessage {
            kind: MessageType::Request,
            id: id.into(),
            method: method.into(),
            params,
            result: None,
            error: None,
            error_code: 0,
        }
    }

    /// Creates a successful response frame correlated to `id`.
    pub fn response(id: impl Into<String>, result: Value) -> Self {
        RpcMessage {
            kind: MessageType::Response,
            id: id.into(),
            method: String::new(),
            params: Map::new(),
            result: Some(result),
            error: None,
            error_code: 0,
        }
    }

    /// Creates an error response frame correlated to `id`.
    pub fn error_response(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        RpcMessage {
            kind: MessageType::Response,
            id: id.into(),
            method: String::new(),
            params: Map::new(),
            result: None,
            error: Some(message.into()),
            error_code: code,
        }
    }

    /// Returns true if this is an error response.
    ///
    /// Presence of `error` decides, independently of `result`.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
