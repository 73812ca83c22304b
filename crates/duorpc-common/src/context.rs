//! Handler-facing request context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::connection::Connection;
use crate::protocol::message::RpcParams;
use crate::protocol::{Result, RpcMessage};

/// Per-request view handed to a handler by the connection's read loop.
///
/// Exposes the request parameters through typed accessors with lenient
/// coercion (the codec is schemaless, so parameters arrive as dynamic JSON
/// values), the authenticated peer identity, and exactly-once response
/// emission. Contexts are not reusable across requests.
pub struct Context {
    conn: Arc<Connection>,
    request_id: String,
    params: RpcParams,
    peer_id: Option<String>,
    replied: AtomicBool,
}

impl Context {
    pub(crate) fn new(
        conn: Arc<Connection>,
        request_id: String,
        params: RpcParams,
        peer_id: Option<String>,
    ) -> Self {
        Self {
            conn,
            request_id,
            params,
            peer_id,
            replied: AtomicBool::new(false),
        }
    }

    /// Returns the authenticated id of the peer that sent this request.
    ///
    /// Only set on server-side connections; on the client side the server
    /// has no id and this returns `None`.
    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    /// Returns the correlation id of the request being handled.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Returns the string parameter `name`, or `default` if missing or not
    /// a string.
    pub fn param_string(&self, name: &str, default: &str) -> String {
        match self.params.get(name) {
            Some(Value::String(s)) => s.clone(),
            _ => default.to_string(),
        }
    }

    /// Returns the integer parameter `name`, or `default` if missing or
    /// not convertible.
    ///
    /// JSON numbers convert by truncation toward zero; strings are parsed
    /// as integers.
    pub fn param_int(&self, name: &str, default: i64) -> i64 {
        match self.params.get(name) {
            Some(Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    i
                } else if let Some(f) = n.as_f64() {
                    f as i64
                } else {
                    default
                }
            }
            Some(Value::String(s)) => s.parse().unwrap_or(default),
            _ => default,
        }
    }

    /// Returns the float parameter `name`, or `default` if missing or not
    /// convertible.
    pub fn param_float(&self, name: &str, default: f64) -> f64 {
        match self.params.get(name) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
            Some(Value::String(s)) => s.parse().unwrap_or(default),
            _ => default,
        }
    }

    /// Sends a successful response carrying `value`.
    ///
    /// Only the first of `respond`/`fail` on a context emits a frame;
    /// subsequent calls are silently dropped.
    pub async fn respond<T: Serialize>(&self, value: T) -> Result<()> {
        let result = serde_json::to_value(value)?;
        if self.replied.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let msg = RpcMessage::response(self.request_id.clone(), result);
        self.conn.send(&msg).await
    }

    /// Sends an error response carrying `code` and `message`.
    pub async fn fail(&self, code: i32, message: &str) -> Result<()> {
        if self.replied.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let msg = RpcMessage::error_response(self.request_id.clone(), code, message);
        self.conn.send(&msg).await
    }
}
