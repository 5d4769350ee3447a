//! HTTPS transport driver.
//!
//! TCP connect plus a rustls client handshake. Certificates are verified
//! against the webpki root store, optionally extended with a CA file for
//! privately signed endpoints. The handle carries the decrypted byte
//! stream; HTTP framing stays out of scope.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::driver::{ConnectError, ConnectTarget, ConnectionHandle, Driver};

use super::tcp::{dial, TcpConnection};

/// Errors that can occur when building the TLS client configuration.
#[derive(Debug)]
pub enum TlsError {
    /// Failed to read the CA file.
    CaRead(std::io::Error),
    /// No certificates found in the CA file.
    NoCerts,
    /// A certificate in the CA file was rejected by the root store.
    BadCert(tokio_rustls::rustls::Error),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CaRead(e) => write!(f, "failed to read CA file: {}", e),
            Self::NoCerts => write!(f, "no certificates found in CA file"),
            Self::BadCert(e) => write!(f, "invalid certificate in CA file: {}", e),
        }
    }
}

impl std::error::Error for TlsError {}

pub struct HttpsDriver {
    connector: TlsConnector,
}

impl HttpsDriver {
    /// A driver trusting the bundled webpki roots.
    pub fn new() -> Self {
        Self::from_roots(webpki_root_store())
    }

    /// A driver trusting the webpki roots plus the certificates in a PEM
    /// CA file.
    pub fn with_ca_file(ca_path: &Path) -> Result<Self, TlsError> {
        let mut roots = webpki_root_store();

        let ca_data = std::fs::read(ca_path).map_err(TlsError::CaRead)?;
        let certs: Vec<_> = rustls_pemfile::certs(&mut &ca_data[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(TlsError::CaRead)?;
        if certs.is_empty() {
            return Err(TlsError::NoCerts);
        }
        for cert in certs {
            roots.add(cert).map_err(TlsError::BadCert)?;
        }

        Ok(Self::from_roots(roots))
    }

    fn from_roots(roots: RootCertStore) -> Self {
        // Ensure a CryptoProvider is installed. This is idempotent if already set.
        let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            connector: TlsConnector::from(Arc::new(config)),
        }
    }
}

impl Default for HttpsDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn webpki_root_store() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

impl Driver for HttpsDriver {
    fn connect(
        &self,
        target: &ConnectTarget,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<Arc<dyn ConnectionHandle>, ConnectError>> {
        let target = target.clone();
        let connector = self.connector.clone();
        Box::pin(async move {
            tokio::time::timeout(timeout, async {
                let server_name = ServerName::try_from(target.host.clone())
                    .map_err(|_| ConnectError::Protocol("invalid server name".to_string()))?;

                let stream = dial(&target).await?;
                let peer = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| target.socket_addr());

                let tls_stream = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| ConnectError::Protocol(format!("tls handshake failed: {}", e)))?;

                tracing::debug!(peer = %peer, "tls handshake completed");
                Ok(TcpConnection::spawn(tls_stream, peer) as Arc<dyn ConnectionHandle>)
            })
            .await
            .map_err(|_| ConnectError::Timeout)?
        })
    }
}
