use std::sync::{Arc, Once};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::protocol::error::{DuorpcError, Result};

/// Default timeout for dialing a remote endpoint (5 seconds)
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Any ordered, reliable duplex byte stream usable as an RPC transport.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// A transport whose concrete type is erased (plain TCP or TLS).
pub type BoxedTransport = Box<dyn Transport>;

/// Installs the ring crypto provider as the process default.
///
/// Safe to call from multiple threads; only the first call has any effect.
pub fn ensure_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// TLS parameters for an outbound connection.
///
/// The ALPN token is applied to a clone of the embedder's config at dial
/// time, so the same config can be shared across protocols.
#[derive(Clone)]
pub struct TlsClientConfig {
    /// The rustls client configuration (certificate validation, roots, ...)
    pub config: rustls::ClientConfig,
    /// Name presented for SNI and certificate validation
    pub server_name: String,
    /// ALPN protocol token (e.g. `"duorpc"`)
    pub alpn: String,
}

/// Dials the transport layer, with or without TLS.
///
/// # Example
///
/// ```no_run
/// use duorpc_common::transport::Dialer;
///
/// # async fn example() -> duorpc_common::Result<()> {
/// let dialer = Dialer::new();
/// let stream = dialer.dial("127.0.0.1:9443").await?;
/// # Ok(())
/// # }
/// ```
pub struct Dialer {
    pub timeout: Duration,
    pub tls: Option<TlsClientConfig>,
}

impl Dialer {
    /// Creates a plaintext dialer with the default timeout.
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_DIAL_TIMEOUT,
            tls: None,
        }
    }

    /// Creates a TLS dialer with the default timeout.
    pub fn with_tls(tls: TlsClientConfig) -> Self {
        Self {
            timeout: DEFAULT_DIAL_TIMEOUT,
            tls: Some(tls),
        }
    }

    /// Connects to `addr`, performing the TLS handshake when configured.
    ///
    /// # Errors
    ///
    /// Returns a timeout error if the whole dial (including the TLS
    /// handshake) exceeds the configured timeout, and a connection error
    /// for unreachable endpoints or failed TLS handshakes.
    pub async fn dial(&self, addr: &str) -> Result<BoxedTransport> {
        let timeout_ms = self.timeout.as_millis() as u64;
        tokio::time::timeout(self.timeout, self.dial_inner(addr))
            .await
            .map_err(|_| DuorpcError::Timeout(timeout_ms))?
    }

    async fn dial_inner(&self, addr: &str) -> Result<BoxedTransport> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| DuorpcError::Connection(format!("failed to connect to {}: {}", addr, e)))?;

        match &self.tls {
            Some(tls) => {
                ensure_crypto_provider();

                let mut config = tls.config.clone();
                config.alpn_protocols = vec![tls.alpn.as_bytes().to_vec()];
                let connector = TlsConnector::from(Arc::new(config));

                let server_name = ServerName::try_from(tls.server_name.clone()).map_err(|_| {
                    DuorpcError::Connection(format!("invalid TLS server name {:?}", tls.server_name))
                })?;

                let stream = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| DuorpcError::Connection(format!("TLS handshake failed: {}", e)))?;
                Ok(Box::new(stream) as BoxedTransport)
            }
            None => Ok(Box::new(stream) as BoxedTransport),
        }
    }
}

impl Default for Dialer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dial_unreachable_address() {
        let dialer = Dialer::new();
        // reserved TEST-NET-1 address, nothing listens there
        let result = dialer.dial("192.0.2.1:1").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dialer = Dialer::new();
        match dialer.dial(&addr.to_string()).await {
            Err(DuorpcError::Connection(_)) | Err(DuorpcError::Timeout(_)) => {}
            other => panic!("expected connection failure, got {:?}", other.map(|_| ())),
        }
    }
}
