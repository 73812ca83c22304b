//! TLS listener configuration helpers.
//!
//! TLS material is the embedder's responsibility; this module only turns
//! PEM files into the `rustls::ServerConfig` that
//! [`Server::serve_tls`](crate::Server::serve_tls) consumes.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use duorpc_common::protocol::{DuorpcError, Result};
use duorpc_common::transport::ensure_crypto_provider;

/// Certificate and key locations for a TLS listener, plus the optional
/// ALPN token advertised to clients.
#[derive(Clone, Debug)]
pub struct TlsServerConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub alpn: Option<String>,
}

impl TlsServerConfig {
    pub fn from_pem_files(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            alpn: None,
        }
    }

    /// Sets the ALPN protocol token (e.g. `"duorpc"`).
    pub fn with_alpn(mut self, alpn: impl Into<String>) -> Self {
        self.alpn = Some(alpn.into());
        self
    }

    /// Builds the rustls server configuration.
    pub fn build(&self) -> Result<Arc<rustls::ServerConfig>> {
        ensure_crypto_provider();

        let certs = load_certs(&self.cert_path)?;
        let key = load_private_key(&self.key_path)?;

        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| DuorpcError::Connection(format!("invalid TLS config: {}", e)))?;
        if let Some(alpn) = &self.alpn {
            config.alpn_protocols = vec![alpn.as_bytes().to_vec()];
        }
        Ok(Arc::new(config))
    }
}

fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| DuorpcError::Connection(format!("open cert {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| DuorpcError::Connection(format!("parse cert {:?}: {}", path, e)))?;
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| DuorpcError::Connection(format!("open key {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    match rustls_pemfile::private_key(&mut reader)
        .map_err(|e| DuorpcError::Connection(format!("parse private key {:?}: {}", path, e)))?
    {
        Some(key) => Ok(key),
        None => Err(DuorpcError::Connection(format!(
            "no private key found in {:?}",
            path
        ))),
    }
}
