//! TLS termination with rustls.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::error::{ConfigError, Error};

/// Upper bound on a single handshake. A client that stalls longer is dropped.
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Server-side TLS settings.
///
/// Connections negotiate HTTP/2 or HTTP/1.1 over ALPN when the config is
/// built from PEM files; a config passed to [`from_server_config`] is used
/// as-is.
///
/// [`from_server_config`]: TlsConfig::from_server_config
#[derive(Clone)]
pub struct TlsConfig {
    server: Arc<ServerConfig>,
}

impl TlsConfig {
    /// Loads a certificate chain and private key from PEM files.
    pub fn from_pem_files(cert: impl AsRef<Path>, key: impl AsRef<Path>) -> Result<Self, Error> {
        let cert = cert.as_ref();
        let key = key.as_ref();

        let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert)?))
            .collect::<Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            return Err(ConfigError::Tls(format!("no certificates in {}", cert.display())).into());
        }
        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key)?))?
            .ok_or_else(|| ConfigError::Tls(format!("no private key in {}", key.display())))?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut server = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        server.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(Self { server: Arc::new(server) })
    }

    pub fn from_server_config(server: Arc<ServerConfig>) -> Self {
        Self { server }
    }

    pub(crate) fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(Arc::clone(&self.server))
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("alpn", &self.server.alpn_protocols.len())
            .finish_non_exhaustive()
    }
}
