use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use duorpc_common::protocol::{DuorpcError, MessageType, NegotiationMessage, Result};
use duorpc_common::transport::{Dialer, TlsClientConfig};
use duorpc_common::{CallHandle, Connection, Context, HandlerRegistry};

/// Overall deadline for the initial connection attempt in `start()`.
const START_TIMEOUT: Duration = Duration::from_secs(5);

/// Base delay of the reconnect backoff (doubles per attempt).
const BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Upper bound on the reconnect backoff delay.
const BACKOFF_MAX: Duration = Duration::from_secs(180);

/// Default interval between automatic heartbeat pings.
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Per-ping timeout of the automatic heartbeat.
const HEARTBEAT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

type OnReadyFn = Arc<dyn Fn(Arc<Connection>) + Send + Sync>;

/// Connection parameters fixed at construction time.
#[derive(Clone)]
struct ConnectConfig {
    addr: String,
    client_id: String,
    auth_code: String,
    use_compression: bool,
    heartbeat_interval: Option<Duration>,
    tls: Option<TlsClientConfig>,
}

/// An auto-reconnecting RPC client.
///
/// Configure with the builder-style `with_*` methods, register handlers
/// for server-initiated calls, then [`start`] it. The client is cheaply
/// cloneable; all clones share the same connection slot.
///
/// [`start`]: AutoClient::start
#[derive(Clone)]
pub struct AutoClient {
    config: ConnectConfig,
    handlers: Arc<HandlerRegistry>,
    on_ready: Option<OnReadyFn>,
    active: Arc<RwLock<Option<Arc<Connection>>>>,
    stop: CancellationToken,
}

impl AutoClient {
    /// Creates a client ready to connect to `addr` with the given identity
    /// and credential.
    pub fn new(
        addr: impl Into<String>,
        client_id: impl Into<String>,
        auth_code: impl Into<String>,
    ) -> Self {
        Self {
            config: ConnectConfig {
                addr: addr.into(),
                client_id: client_id.into(),
                auth_code: auth_code.into(),
                use_compression: false,
                heartbeat_interval: Some(DEFAULT_HEARTBEAT_INTERVAL),
                tls: None,
            },
            handlers: Arc::new(HandlerRegistry::new()),
            on_ready: None,
            active: Arc::new(RwLock::new(None)),
            stop: CancellationToken::new(),
        }
    }

    /// Dials with TLS using the given configuration (including the ALPN
    /// token).
    pub fn with_tls(mut self, tls: TlsClientConfig) -> Self {
        self.config.tls = Some(tls);
        self
    }

    /// Requests gzip compression of RPC frames during the handshake.
    pub fn with_compression(mut self, enable: bool) -> Self {
        self.config.use_compression = enable;
        self
    }

    /// Overrides the automatic heartbeat interval (default 30 seconds).
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = Some(interval);
        self
    }

    /// Disables the automatic heartbeat; the embedder must invoke `Ping`
    /// itself to stay registered on the server.
    pub fn without_heartbeat(mut self) -> Self {
        self.config.heartbeat_interval = None;
        self
    }

    /// Sets a callback invoked once per successful handshake with the new
    /// connection. Must not block; spawn internally if needed.
    pub fn on_ready<F>(mut self, callback: F) -> Self
    where
        F: Fn(Arc<Connection>) + Send + Sync + 'static,
    {
        self.on_ready = Some(Arc::new(callback));
        self
    }

    /// Registers a handler for server-initiated calls. Handlers registered
    /// before [`start`](AutoClient::start) are attached to every connection
    /// the client establishes.
    pub fn register_handler<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.handlers.register(method, handler);
    }

    /// Attempts the first connection and, on success, spawns the
    /// auto-reconnect loop.
    ///
    /// The attempt is bounded by a 5-second deadline; its outcome (dial
    /// failure, authentication rejection, timeout) is returned directly.
    pub async fn start(&self) -> Result<()> {
        let conn = match tokio::time::timeout(START_TIMEOUT, self.connect_once()).await {
            Ok(outcome) => outcome?,
            Err(_) => return Err(DuorpcError::Timeout(START_TIMEOUT.as_millis() as u64)),
        };

        let client = self.clone();
        tokio::spawn(async move { client.reconnect_loop(conn).await });
        Ok(())
    }

    /// Stops the reconnect loop and closes the current connection.
    pub async fn stop(&self) {
        self.stop.cancel();
        let conn = self.active.write().unwrap().take();
        if let Some(conn) = conn {
            conn.close().await;
        }
    }

    /// True while the current connection is established and not closed.
    pub fn is_connected(&self) -> bool {
        self.active
            .read()
            .unwrap()
            .as_ref()
            .map(|conn| !conn.is_closed())
            .unwrap_or(false)
    }

    /// Performs a blocking RPC call on the active connection.
    pub async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        self.active_conn()?.call(method, params, timeout).await
    }

    /// Performs a blocking RPC call and decodes the result into `T`.
    pub async fn call_with_result<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<T> {
        self.active_conn()?
            .call_with_result(method, params, timeout)
            .await
    }

    /// Performs an async RPC call; `callback` runs once with the outcome.
    pub async fn call_async<F>(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        callback: F,
    ) -> Result<CallHandle>
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        self.active_conn()?
            .call_async(method, params, timeout, callback)
            .await
    }

    /// Performs an async RPC call; `callback` runs once with the decoded
    /// result.
    pub async fn call_async_with_result<T, F>(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        callback: F,
    ) -> Result<CallHandle>
    where
        T: DeserializeOwned + Send + 'static,
        F: FnOnce(Result<T>) + Send + 'static,
    {
        self.active_conn()?
            .call_async_with_result(method, params, timeout, callback)
            .await
    }

    fn active_conn(&self) -> Result<Arc<Connection>> {
        self.active
            .read()
            .unwrap()
            .clone()
            .ok_or(DuorpcError::NotConnected)
    }

    /// One full connection attempt: dial, handshake, compression, read
    /// loop, publish.
    async fn connect_once(&self) -> Result<Arc<Connection>> {
        let config = &self.config;
        let dialer = Dialer {
            timeout: START_TIMEOUT,
            tls: config.tls.clone(),
        };
        let stream = dialer.dial(&config.addr).await?;

        let conn = Arc::new(Connection::new(stream, Arc::clone(&self.handlers)));
        conn.send_negotiation(&NegotiationMessage::auth_request(
            &config.client_id,
            &config.auth_code,
            config.use_compression,
        ))
        .await?;

        let reply = conn.receive_negotiation().await?;
        if reply.kind != MessageType::AuthOk {
            return Err(DuorpcError::AuthenticationFailed);
        }
        if reply.use_compression {
            conn.enable_compression().await;
        }

        tokio::spawn(Arc::clone(&conn).read_loop());

        if let Some(interval) = config.heartbeat_interval {
            spawn_heartbeat(Arc::clone(&conn), interval);
        }

        *self.active.write().unwrap() = Some(Arc::clone(&conn));
        info!(addr = %config.addr, compression = reply.use_compression, "connected");

        if let Some(on_ready) = &self.on_ready {
            on_ready(Arc::clone(&conn));
        }

        Ok(conn)
    }

    /// Watches the current connection and redials with exponential backoff
    /// whenever it closes.
    async fn reconnect_loop(self, mut conn: Arc<Connection>) {
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = conn.closed() => {}
            }
            self.active.write().unwrap().take();
            info!(addr = %self.config.addr, "connection lost, reconnecting");

            let mut attempt: u32 = 1;
            conn = loop {
                if self.stop.is_cancelled() {
                    return;
                }
                match self.connect_once().await {
                    Ok(conn) => break conn,
                    Err(e) => {
                        let delay = backoff_delay(attempt);
                        warn!(
                            attempt,
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "reconnect failed"
                        );
                        tokio::select! {
                            _ = self.stop.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        attempt = attempt.saturating_add(1);
                    }
                }
            };
        }
    }
}

/// Pings the server periodically until the connection closes.
fn spawn_heartbeat(conn: Arc<Connection>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = conn.closed() => return,
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = conn.call("Ping", Value::Null, HEARTBEAT_CALL_TIMEOUT).await {
                        debug!(error = %e, "heartbeat ping failed");
                    }
                }
            }
        }
    });
}

/// Backoff delay for the given 1-based attempt: 2s, 4s, 8s, ... capped at
/// 3 minutes.
fn backoff_delay(attempt: u32) -> Duration {
    // 2s << 7 = 256s already exceeds the cap
    let exponent = attempt.saturating_sub(1).min(7);
    let delay = BACKOFF_BASE.saturating_mul(1u32 << exponent);
    delay.min(BACKOFF_MAX)
}
