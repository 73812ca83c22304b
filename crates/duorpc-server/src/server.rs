use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use duorpc_common::protocol::{DuorpcError, MessageType, NegotiationMessage, Result};
use duorpc_common::{CallHandle, Connection, Context, HandlerRegistry};

/// Clients that have not pinged within this window are considered dead.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(40);

/// Authentication predicate: `(client_id, auth_code) -> accepted`.
///
/// Invoked exactly once per incoming connection, before any RPC frame is
/// processed.
type AuthFn = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

struct ClientEntry {
    conn: Arc<Connection>,
    last_ping: Instant,
}

/// The DuoRPC server.
///
/// Cheaply cloneable; all clones share the handler registry and the client
/// registry, so one server value can back several listeners.
#[derive(Clone)]
pub struct Server {
    auth: AuthFn,
    handlers: Arc<HandlerRegistry>,
    clients: Arc<RwLock<HashMap<String, ClientEntry>>>,
    heartbeat_timeout: Duration,
}

impl Server {
    /// Creates a server with the given authentication predicate.
    ///
    /// The built-in `Ping` handler is registered here: it refreshes the
    /// caller's heartbeat timestamp and responds `"pong"`.
    pub fn new<F>(auth: F) -> Self
    where
        F: Fn(&str, &str) -> bool + Send + Sync + 'static,
    {
        let handlers = Arc::new(HandlerRegistry::new());
        let clients: Arc<RwLock<HashMap<String, ClientEntry>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let ping_clients = Arc::clone(&clients);
        handlers.register("Ping", move |ctx: Context| {
            let clients = Arc::clone(&ping_clients);
            async move {
                if let Some(id) = ctx.peer_id() {
                    if let Some(entry) = clients.write().unwrap().get_mut(id) {
                        entry.last_ping = Instant::now();
                    }
                }
                let _ = ctx.respond("pong").await;
            }
        });

        Self {
            auth: Arc::new(auth),
            handlers,
            clients,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }

    /// Overrides the heartbeat timeout (default 40 seconds).
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Registers an RPC handler, replacing any previous one for `method`.
    pub fn register_handler<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.handlers.register(method, handler);
    }

    /// Binds `addr` and accepts plaintext TCP connections until the task
    /// is dropped.
    pub async fn serve(&self, addr: &str) -> Result<()> {
        let listener = bind(addr).await?;
        let local_addr = listener.local_addr().map_err(DuorpcError::Io)?;
        info!(addr = %local_addr, "listening");
        self.serve_on(listener).await
    }

    /// Accepts connections from an already-bound listener.
    ///
    /// Accept errors are logged and the loop continues; each accepted
    /// connection is served on its own task. Connection tasks are tied to
    /// this future: dropping it tears down every connection it accepted.
    pub async fn serve_on(&self, listener: TcpListener) -> Result<()> {
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!(%peer_addr, "accepted connection");
                        let server = self.clone();
                        tasks.spawn(async move { server.serve_conn(stream).await });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept error");
                    }
                },
                Some(_) = tasks.join_next() => {}
            }
        }
    }

    /// Binds `addr` and accepts TLS connections.
    ///
    /// The rustls configuration (certificates, ALPN protocols, client
    /// auth) is supplied by the embedder; see [`crate::TlsServerConfig`]
    /// for a PEM-file helper.
    pub async fn serve_tls(&self, addr: &str, config: Arc<rustls::ServerConfig>) -> Result<()> {
        let listener = bind(addr).await?;
        let local_addr = listener.local_addr().map_err(DuorpcError::Io)?;
        info!(addr = %local_addr, "listening (TLS)");
        self.serve_tls_on(listener, config).await
    }

    /// Accepts TLS connections from an already-bound listener.
    pub async fn serve_tls_on(
        &self,
        listener: TcpListener,
        config: Arc<rustls::ServerConfig>,
    ) -> Result<()> {
        let acceptor = TlsAcceptor::from(config);
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let acceptor = acceptor.clone();
                        let server = self.clone();
                        tasks.spawn(async move {
                            match acceptor.accept(stream).await {
                                Ok(tls_stream) => server.serve_conn(tls_stream).await,
                                Err(e) => warn!(%peer_addr, error = %e, "TLS handshake failed"),
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept error");
                    }
                },
                Some(_) = tasks.join_next() => {}
            }
        }
    }

    /// Handles one incoming connection: handshake, registration, read loop,
    /// deregistration.
    ///
    /// Returns when the connection terminates. The registry entry exists
    /// exactly between a successful handshake and the read loop's exit (or
    /// an earlier heartbeat eviction).
    pub async fn serve_conn<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn = Arc::new(Connection::new(stream, Arc::clone(&self.handlers)));

        let negotiation = match conn.receive_negotiation().await {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "failed to receive negotiation");
                return;
            }
        };

        if negotiation.kind != MessageType::AuthRequest {
            warn!(kind = ?negotiation.kind, "unexpected negotiation type");
            return;
        }

        if !(self.auth)(&negotiation.client_id, &negotiation.auth_code) {
            warn!(client_id = %negotiation.client_id, "authentication failed");
            let _ = conn.send_negotiation(&NegotiationMessage::auth_fail()).await;
            return;
        }

        let client_id = negotiation.client_id.clone();
        conn.set_peer_id(client_id.clone());

        // the server accepts whatever compression mode the client requested
        let use_compression = negotiation.use_compression;
        if let Err(e) = conn
            .send_negotiation(&NegotiationMessage::auth_ok(use_compression))
            .await
        {
            warn!(client_id = %client_id, error = %e, "failed to send auth_ok");
            return;
        }
        if use_compression {
            conn.enable_compression().await;
        }

        {
            let mut clients = self.clients.write().unwrap();
            clients.insert(
                client_id.clone(),
                ClientEntry {
                    conn: Arc::clone(&conn),
                    last_ping: Instant::now(),
                },
            );
        }
        info!(client_id = %client_id, compression = use_compression, "client connected");

        Arc::clone(&conn).read_loop().await;

        info!(client_id = %client_id, "client disconnected");
        let mut clients = self.clients.write().unwrap();
        // a reconnect may already have replaced this entry under the same id
        if let Some(entry) = clients.get(&client_id) {
            if Arc::ptr_eq(&entry.conn, &conn) {
                clients.remove(&client_id);
            }
        }
    }

    /// Returns the active connection for `client_id`.
    ///
    /// A client whose last `Ping` is older than the heartbeat timeout is
    /// considered dead; the query evicts it and returns `None`.
    pub fn get_client(&self, client_id: &str) -> Option<Arc<Connection>> {
        let mut clients = self.clients.write().unwrap();
        let entry = clients.get(client_id)?;
        if entry.last_ping.elapsed() > self.heartbeat_timeout {
            warn!(client_id, "client considered inactive, evicting");
            clients.remove(client_id);
            return None;
        }
        Some(Arc::clone(&entry.conn))
    }

    /// Sends a blocking RPC call to a client.
    pub async fn call(
        &self,
        client_id: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let conn = self.client_or_err(client_id)?;
        conn.call(method, params, timeout).await
    }

    /// Sends a blocking RPC call and decodes the result into `T`.
    pub async fn call_with_result<T: DeserializeOwned>(
        &self,
        client_id: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<T> {
        let conn = self.client_or_err(client_id)?;
        conn.call_with_result(method, params, timeout).await
    }

    /// Sends an async call; `callback` runs once with the outcome.
    pub async fn call_async<F>(
        &self,
        client_id: &str,
        method: &str,
        params: Value,
        timeout: Duration,
        callback: F,
    ) -> Result<CallHandle>
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        let conn = self.client_or_err(client_id)?;
        conn.call_async(method, params, timeout, callback).await
    }

    /// Sends an async call; `callback` runs once with the decoded result.
    pub async fn call_async_with_result<T, F>(
        &self,
        client_id: &str,
        method: &str,
        params: Value,
        timeout: Duration,
        callback: F,
    ) -> Result<CallHandle>
    where
        T: DeserializeOwned + Send + 'static,
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let conn = self.client_or_err(client_id)?;
        conn.call_async_with_result(method, params, timeout, callback)
            .await
    }

    fn client_or_err(&self, client_id: &str) -> Result<Arc<Connection>> {
        self.get_client(client_id)
            .ok_or_else(|| DuorpcError::ClientNotConnected(client_id.to_string()))
    }

    #[cfg(test)]
    fn registered_client_count(&self) -> usize {
        self.clients.read().unwrap().len()
    }
}

async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| DuorpcError::Connection(format!("failed to listen on {}: {}", addr, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Drives the client side of the handshake by hand over an in-memory
    /// duplex stream, returning the client's connection end.
    async fn handshake_client(
        server: &Server,
        client_id: &str,
        auth_code: &str,
        use_compression: bool,
    ) -> (Arc<Connection>, NegotiationMessage) {
        let (client_end, server_end) = tokio::io::duplex(1024 * 1024);

        let server = server.clone();
        tokio::spawn(async move { server.serve_conn(server_end).await });

        let conn = Arc::new(Connection::new(client_end, Arc::new(HandlerRegistry::new())));
        conn.send_negotiation(&NegotiationMessage::auth_request(
            client_id,
            auth_code,
            use_compression,
        ))
        .await
        .unwrap();
        let reply = conn.receive_negotiation().await.unwrap();
        if reply.kind == MessageType::AuthOk && reply.use_compression {
            conn.enable_compression().await;
        }
        (conn, reply)
    }

    fn test_server() -> Server {
        Server::new(|client_id, auth_code| client_id == "client42" && auth_code == "s3cr3t")
    }

    #[tokio::test]
    async fn test_handshake_accepts_valid_credentials() {
        let server = test_server();
        let (_conn, reply) = handshake_client(&server, "client42", "s3cr3t", false).await;

        assert_eq!(reply.kind, MessageType::AuthOk);
        // registration happens right after auth_ok is sent
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server.get_client("client42").is_some());
    }

    #[tokio::test]
    async fn test_handshake_echoes_compression_request() {
        let server = test_server();
        let (_conn, reply) = handshake_client(&server, "client42", "s3cr3t", true).await;

        assert_eq!(reply.kind, MessageType::AuthOk);
        assert!(reply.use_compression);
    }

    #[tokio::test]
    async fn test_handshake_rejects_bad_credentials() {
        let server = test_server();
        let (_conn, reply) = handshake_client(&server, "client42", "wrong", false).await;

        assert_eq!(reply.kind, MessageType::AuthFail);
        assert_eq!(server.registered_client_count(), 0);
    }

    #[tokio::test]
    async fn test_handshake_rejects_non_auth_request() {
        let server = test_server();
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);

        let srv = server.clone();
        let served = tokio::spawn(async move { srv.serve_conn(server_end).await });

        let conn = Arc::new(Connection::new(client_end, Arc::new(HandlerRegistry::new())));
        conn.send_negotiation(&NegotiationMessage::auth_ok(false))
            .await
            .unwrap();

        served.await.unwrap();
        assert_eq!(server.registered_client_count(), 0);
    }

    #[tokio::test]
    async fn test_ping_refreshes_heartbeat() {
        let server = test_server().with_heartbeat_timeout(Duration::from_millis(400));
        let (conn, _reply) = handshake_client(&server, "client42", "s3cr3t", false).await;

        let client = Arc::clone(&conn);
        tokio::spawn(async move { client.read_loop().await });

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let pong = conn.call("Ping", json!({}), Duration::from_secs(1)).await.unwrap();
            assert_eq!(pong, json!("pong"));
        }

        // well past the timeout in wall time, but pings kept it alive
        assert!(server.get_client("client42").is_some());
    }

    #[tokio::test]
    async fn test_stale_client_is_evicted_on_query() {
        let server = test_server().with_heartbeat_timeout(Duration::from_millis(100));
        let (_conn, _reply) = handshake_client(&server, "client42", "s3cr3t", false).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server.get_client("client42").is_some());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(server.get_client("client42").is_none());
        // the query removed the entry
        assert_eq!(server.registered_client_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_deregisters_client() {
        let server = test_server();
        let (conn, _reply) = handshake_client(&server, "client42", "s3cr3t", false).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.registered_client_count(), 1);

        conn.close().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.registered_client_count(), 0);
    }

    #[tokio::test]
    async fn test_call_to_unknown_client_fails() {
        let server = test_server();

        let err = server
            .call("ghost", "Echo", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();

        match err {
            DuorpcError::ClientNotConnected(id) => assert_eq!(id, "ghost"),
            other => panic!("expected ClientNotConnected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_calls_client_handler() {
        let server = test_server();

        let client_handlers = Arc::new(HandlerRegistry::new());
        client_handlers.register("Multiply", |ctx| async move {
            let num = ctx.param_int("num", 0);
            let factor = ctx.param_int("factor", 1);
            let _ = ctx.respond(num * factor).await;
        });

        let (client_end, server_end) = tokio::io::duplex(1024 * 1024);
        let srv = server.clone();
        tokio::spawn(async move { srv.serve_conn(server_end).await });

        let conn = Arc::new(Connection::new(client_end, client_handlers));
        conn.send_negotiation(&NegotiationMessage::auth_request("client42", "s3cr3t", false))
            .await
            .unwrap();
        let reply = conn.receive_negotiation().await.unwrap();
        assert_eq!(reply.kind, MessageType::AuthOk);

        let client = Arc::clone(&conn);
        tokio::spawn(async move { client.read_loop().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result: i64 = server
            .call_with_result(
                "client42",
                "Multiply",
                json!({"num": 10, "factor": 2}),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(result, 20);
    }
}
