//! The bidirectional RPC connection.
//!
//! A [`Connection`] wraps one duplex transport after (or during) the
//! authentication handshake. It owns the pending-call table correlating
//! outbound requests with inbound responses, a serialized send path, and
//! the read loop that dispatches inbound frames. Both endpoints of a
//! session hold the same type: once the handshake completes the protocol
//! is symmetric.
//!
//! # Concurrency
//!
//! - one read-loop task per connection; inbound requests are dispatched on
//!   fresh tasks so a slow handler never stalls the reader
//! - all outbound writes serialize through the writer mutex, so frames are
//!   never interleaved on the wire
//! - the pending table is a plain mutex with short, non-awaiting critical
//!   sections, never taken while holding the writer mutex

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::Context;
use crate::convert::decode_value;
use crate::handler::HandlerRegistry;
use crate::protocol::message::RpcParams;
use crate::protocol::{DuorpcError, MessageType, NegotiationMessage, Result, RpcMessage};
use crate::transport::frame::{FrameReader, FrameWriter};

/// One endpoint of a bidirectional RPC session.
pub struct Connection {
    writer: Mutex<FrameWriter>,
    reader: Mutex<FrameReader>,
    pending: StdMutex<HashMap<String, oneshot::Sender<RpcMessage>>>,
    handlers: Arc<HandlerRegistry>,
    peer_id: std::sync::OnceLock<String>,
    closed_tx: watch::Sender<bool>,
}

impl Connection {
    /// Wraps an open transport.
    ///
    /// The connection starts in the negotiating state: negotiation frames
    /// may be exchanged, compression may be enabled, and only then should
    /// [`Connection::read_loop`] be started.
    pub fn new<S>(stream: S, handlers: Arc<HandlerRegistry>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (closed_tx, _) = watch::channel(false);
        Self {
            writer: Mutex::new(FrameWriter::new(Box::new(write_half))),
            reader: Mutex::new(FrameReader::new(Box::new(read_half))),
            pending: StdMutex::new(HashMap::new()),
            handlers,
            peer_id: std::sync::OnceLock::new(),
            closed_tx,
        }
    }

    /// Records the authenticated identity of the peer.
    ///
    /// Called by the server after a successful handshake, before the read
    /// loop starts; has no effect if already set.
    pub fn set_peer_id(&self, peer_id: impl Into<String>) {
        let _ = self.peer_id.set(peer_id.into());
    }

    /// Returns the authenticated peer identity, if any.
    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.get().map(|s| s.as_str())
    }

    /// Sends a negotiation frame, always uncompressed.
    pub async fn send_negotiation(&self, msg: &NegotiationMessage) -> Result<()> {
        let payload = serde_json::to_vec(msg)?;
        let mut writer = self.writer.lock().await;
        writer.write_frame(&payload).await
    }

    /// Reads one negotiation frame from the raw stream.
    pub async fn receive_negotiation(&self) -> Result<NegotiationMessage> {
        let frame = {
            let mut reader = self.reader.lock().await;
            reader.read_frame().await?
        };
        serde_json::from_slice(&frame)
            .map_err(|e| DuorpcError::Handshake(format!("invalid negotiation frame: {}", e)))
    }

    /// Switches both directions to compressed frames.
    ///
    /// Must be called between the `auth_ok` exchange and the start of the
    /// read loop, while no other task touches the stream; every RPC frame
    /// from this point on is compressed.
    pub async fn enable_compression(&self) {
        self.writer.lock().await.set_compressed();
        self.reader.lock().await.set_compressed();
    }

    /// True once the connection has terminated.
    ///
    /// Closed is terminal: all pending calls have been failed and any
    /// further send returns a disconnection error.
    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Resolves when the connection terminates (immediately if it already
    /// has).
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Closes the connection, failing all pending calls.
    pub async fn close(&self) {
        self.shutdown();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    fn shutdown(&self) {
        if self.closed_tx.send_replace(true) {
            return;
        }
        // dropping the senders delivers a disconnection error to every waiter
        self.pending.lock().unwrap().clear();
    }

    /// Serializes and transmits a message. Safe for concurrent use.
    pub async fn send(&self, msg: &RpcMessage) -> Result<()> {
        if self.is_closed() {
            return Err(DuorpcError::Disconnected);
        }
        let payload = serde_json::to_vec(msg)?;
        let mut writer = self.writer.lock().await;
        writer.write_frame(&payload).await
    }

    /// Runs the frame decoding loop until the stream fails or closes.
    ///
    /// Responses are delivered to their pending entry (responses with no
    /// entry - the caller timed out or cancelled - are dropped silently).
    /// Requests are dispatched to their handler on a fresh task, or
    /// answered with a `404` error response when no handler is registered.
    /// On exit the connection is closed and every pending call fails with
    /// a disconnection error.
    pub async fn read_loop(self: Arc<Self>) {
        loop {
            let frame = {
                let mut reader = self.reader.lock().await;
                reader.read_frame().await
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(error = %e, "read loop terminated");
                    break;
                }
            };
            let msg: RpcMessage = match serde_json::from_slice(&frame) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(error = %e, "frame decode failed, closing connection");
                    break;
                }
            };
            dispatch(&self, msg).await;
        }
        self.shutdown();
    }

    /// Sends a request and waits for its response.
    ///
    /// `params` must be a JSON object (or null for no parameters). Returns
    /// the peer's result value, a [`DuorpcError::Response`] carrying the
    /// handler's `{code, message}`, a timeout error (the pending entry is
    /// removed; a late response is dropped by the read loop), or a
    /// disconnection error if the connection dies first.
    pub async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let params = params_map(params)?;
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id.clone(), tx);

        let req = RpcMessage::request(id.clone(), method, params);
        if let Err(e) = self.send(&req).await {
            self.pending.lock().unwrap().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(msg)) => response_outcome(msg),
            Ok(Err(_)) => Err(DuorpcError::Disconnected),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(DuorpcError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    /// Sends a request and decodes the response into `T`.
    pub async fn call_with_result<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<T> {
        let result = self.call(method, params, timeout).await?;
        decode_value(result)
    }

    /// Sends a request and invokes `callback` when it completes.
    ///
    /// The callback runs exactly once, with the result, a structured error,
    /// a timeout error, a cancellation error, or a disconnection error.
    /// The returned handle cancels the wait (idempotently); the peer is not
    /// notified and may still execute the handler.
    ///
    /// A send failure is returned directly and the callback never runs.
    pub async fn call_async<F>(
        self: Arc<Self>,
        method: &str,
        params: Value,
        timeout: Duration,
        callback: F,
    ) -> Result<CallHandle>
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        let params = params_map(params)?;
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id.clone(), tx);

        let req = RpcMessage::request(id.clone(), method, params);
        if let Err(e) = self.send(&req).await {
            self.pending.lock().unwrap().remove(&id);
            return Err(e);
        }

        let cancel = CancellationToken::new();
        let handle = CallHandle {
            id: id.clone(),
            cancel: cancel.clone(),
        };

        let conn = Arc::clone(&self);
        let timeout_ms = timeout.as_millis() as u64;
        tokio::spawn(async move {
            let outcome = tokio::select! {
                res = rx => match res {
                    Ok(msg) => response_outcome(msg),
                    Err(_) => Err(DuorpcError::Disconnected),
                },
                _ = tokio::time::sleep(timeout) => Err(DuorpcError::Timeout(timeout_ms)),
                _ = cancel.cancelled() => Err(DuorpcError::Cancelled),
            };
            // the entry is already gone on the delivery path; this covers
            // timeout and cancellation
            conn.pending.lock().unwrap().remove(&id);
            callback(outcome);
        });

        Ok(handle)
    }

    /// Sends a request and invokes `callback` with the decoded result.
    pub async fn call_async_with_result<T, F>(
        self: Arc<Self>,
        method: &str,
        params: Value,
        timeout: Duration,
        callback: F,
    ) -> Result<CallHandle>
    where
        T: DeserializeOwned + Send + 'static,
        F: FnOnce(Result<T>) + Send + 'static,
    {
        self.call_async(method, params, timeout, move |outcome| {
            callback(outcome.and_then(decode_value::<T>))
        })
        .await
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

/// Handle to an in-flight asynchronous call.
#[derive(Clone)]
pub struct CallHandle {
    id: String,
    cancel: CancellationToken,
}

impl CallHandle {
    /// Returns the correlation id of the call.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Cancels the call. Idempotent; a no-op once the call has completed.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Routes one inbound frame: responses to their pending entry, requests
/// to a handler task.
async fn dispatch(conn: &Arc<Connection>, msg: RpcMessage) {
    match msg.kind {
        MessageType::Response => {
            let entry = conn.pending.lock().unwrap().remove(&msg.id);
            match entry {
                Some(tx) => {
                    let _ = tx.send(msg);
                }
                None => {
                    debug!(id = %msg.id, "dropping response with no pending call");
                }
            }
        }
        MessageType::Request => {
            let ctx = Context::new(
                Arc::clone(conn),
                msg.id,
                msg.params,
                conn.peer_id().map(|s| s.to_string()),
            );
            match conn.handlers.get(&msg.method) {
                Some(handler) => {
                    tokio::spawn(handler(ctx));
                }
                None => {
                    if let Err(e) = ctx.fail(404, "method not found").await {
                        debug!(error = %e, "failed to send method-not-found response");
                    }
                }
            }
        }
        other => {
            warn!(kind = ?other, "unknown message type");
        }
    }
}

fn params_map(params: Value) -> Result<RpcParams> {
    match params {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(RpcParams::new()),
        other => Err(DuorpcError::InvalidMessage(format!(
            "params must be a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn response_outcome(msg: RpcMessage) -> Result<Value> {
    match msg.error {
        Some(message) => Err(DuorpcError::Response {
            code: msg.error_code,
            message,
        }),
        None => Ok(msg.result.unwrap_or(Value::Null)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Builds two connected endpoints with read loops running; no
    /// handshake, no compression.
    fn connected_pair(
        left_handlers: Arc<HandlerRegistry>,
        right_handlers: Arc<HandlerRegistry>,
    ) -> (Arc<Connection>, Arc<Connection>) {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let left = Arc::new(Connection::new(a, left_handlers));
        let right = Arc::new(Connection::new(b, right_handlers));

        let conn = Arc::clone(&left);
        tokio::spawn(async move { conn.read_loop().await });
        let conn = Arc::clone(&right);
        tokio::spawn(async move { conn.read_loop().await });

        (left, right)
    }

    fn echo_registry() -> Arc<HandlerRegistry> {
        let handlers = Arc::new(HandlerRegistry::new());
        handlers.register("Echo", |ctx| async move {
            let msg = ctx.param_string("msg", "");
            let _ = ctx.respond(msg).await;
        });
        handlers
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (caller, _peer) = connected_pair(Arc::new(HandlerRegistry::new()), echo_registry());

        let result = caller
            .call("Echo", json!({"msg": "ping"}), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(result, json!("ping"));
        assert_eq!(caller.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_calls_work_in_both_directions() {
        let (left, right) = connected_pair(echo_registry(), echo_registry());

        let from_left = left
            .call("Echo", json!({"msg": "to-right"}), Duration::from_secs(5))
            .await
            .unwrap();
        let from_right = right
            .call("Echo", json!({"msg": "to-left"}), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(from_left, json!("to-right"));
        assert_eq!(from_right, json!("to-left"));
    }

    #[tokio::test]
    async fn test_structured_error() {
        let handlers = Arc::new(HandlerRegistry::new());
        handlers.register("Divide", |ctx| async move {
            let num = ctx.param_int("num", 0);
            let denom = ctx.param_int("denom", 1);
            if denom == 0 {
                let _ = ctx.fail(44, "division by zero").await;
                return;
            }
            let _ = ctx.respond(num / denom).await;
        });
        let (caller, _peer) = connected_pair(Arc::new(HandlerRegistry::new()), handlers);

        let err = caller
            .call("Divide", json!({"num": 10, "denom": 0}), Duration::from_secs(5))
            .await
            .unwrap_err();

        match err {
            DuorpcError::Response { code, message } => {
                assert_eq!(code, 44);
                assert_eq!(message, "division by zero");
            }
            other => panic!("expected structured error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_method_is_404() {
        let (caller, _peer) =
            connected_pair(Arc::new(HandlerRegistry::new()), Arc::new(HandlerRegistry::new()));

        let err = caller
            .call("Nope", json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();

        match err {
            DuorpcError::Response { code, message } => {
                assert_eq!(code, 404);
                assert_eq!(message, "method not found");
            }
            other => panic!("expected 404, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_slow_handler_does_not_block_other_calls() {
        let handlers = Arc::new(HandlerRegistry::new());
        handlers.register("Slow", |ctx| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = ctx.respond("slow").await;
        });
        handlers.register("Fast", |ctx| async move {
            let _ = ctx.respond("fast").await;
        });
        let (caller, _peer) = connected_pair(Arc::new(HandlerRegistry::new()), handlers);

        let slow_caller = Arc::clone(&caller);
        let slow = tokio::spawn(async move {
            slow_caller
                .call("Slow", json!({}), Duration::from_secs(5))
                .await
        });
        // give the slow request a head start on the wire
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        let fast = caller.call("Fast", json!({}), Duration::from_secs(5)).await.unwrap();
        assert_eq!(fast, json!("fast"));
        assert!(started.elapsed() < Duration::from_millis(250));

        assert_eq!(slow.await.unwrap().unwrap(), json!("slow"));
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_entry_and_late_response_is_dropped() {
        let handlers = Arc::new(HandlerRegistry::new());
        handlers.register("Slow", |ctx| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = ctx.respond("late").await;
        });
        handlers.register("Echo", |ctx| async move {
            let msg = ctx.param_string("msg", "");
            let _ = ctx.respond(msg).await;
        });
        let (caller, _peer) = connected_pair(Arc::new(HandlerRegistry::new()), handlers);

        let err = caller
            .call("Slow", json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, DuorpcError::Timeout(50)));
        assert_eq!(caller.pending_len(), 0);

        // let the late response arrive; the read loop must drop it and the
        // connection must stay usable
        tokio::time::sleep(Duration::from_millis(300)).await;
        let result = caller
            .call("Echo", json!({"msg": "still alive"}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result, json!("still alive"));
    }

    #[tokio::test]
    async fn test_call_async_completes() {
        let (caller, _peer) = connected_pair(Arc::new(HandlerRegistry::new()), echo_registry());

        let (tx, rx) = oneshot::channel();
        caller
            .call_async("Echo", json!({"msg": "async"}), Duration::from_secs(5), move |outcome| {
                let _ = tx.send(outcome);
            })
            .await
            .unwrap();

        let outcome = rx.await.unwrap().unwrap();
        assert_eq!(outcome, json!("async"));
    }

    #[tokio::test]
    async fn test_call_async_cancel() {
        let handlers = Arc::new(HandlerRegistry::new());
        handlers.register("Slow", |ctx| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            let _ = ctx.respond("too late").await;
        });
        let (caller, _peer) = connected_pair(Arc::new(HandlerRegistry::new()), handlers);

        let (tx, rx) = oneshot::channel();
        let handle = Arc::clone(&caller)
            .call_async("Slow", json!({}), Duration::from_secs(30), move |outcome| {
                let _ = tx.send(outcome);
            })
            .await
            .unwrap();

        handle.cancel();
        // cancelling again is a no-op
        handle.cancel();

        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, Err(DuorpcError::Cancelled)));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(caller.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_calls() {
        let handlers = Arc::new(HandlerRegistry::new());
        handlers.register("Block", |_ctx| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        let (caller, peer) = connected_pair(Arc::new(HandlerRegistry::new()), handlers);

        let blocked_caller = Arc::clone(&caller);
        let blocked = tokio::spawn(async move {
            blocked_caller
                .call("Block", json!({}), Duration::from_secs(30))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        peer.close().await;

        let err = blocked.await.unwrap().unwrap_err();
        assert!(matches!(err, DuorpcError::Disconnected));

        caller.closed().await;
        assert!(caller.is_closed());
        assert_eq!(caller.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (caller, peer) = connected_pair(Arc::new(HandlerRegistry::new()), echo_registry());

        peer.close().await;
        caller.closed().await;

        let err = caller
            .call("Echo", json!({"msg": "x"}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DuorpcError::Disconnected));
        assert_eq!(caller.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_non_object_params_rejected() {
        let (caller, _peer) = connected_pair(Arc::new(HandlerRegistry::new()), echo_registry());

        let err = caller
            .call("Echo", json!([1, 2, 3]), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DuorpcError::InvalidMessage(_)));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_stream() {
        let handlers = Arc::new(HandlerRegistry::new());
        handlers.register("Square", |ctx| async move {
            let n = ctx.param_int("n", 0);
            let _ = ctx.respond(n * n).await;
        });
        let (caller, _peer) = connected_pair(Arc::new(HandlerRegistry::new()), handlers);

        let mut tasks = tokio::task::JoinSet::new();
        for n in 0..32i64 {
            let caller = Arc::clone(&caller);
            tasks.spawn(async move {
                let result = caller
                    .call("Square", json!({"n": n}), Duration::from_secs(5))
                    .await
                    .unwrap();
                assert_eq!(result, json!(n * n));
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }
        assert_eq!(caller.pending_len(), 0);
    }
}
