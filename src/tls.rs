//! TLS upgrade capability for the Oracle listener. Certificate *loading* is
//! the external collaborator per `SPEC_FULL.md` §9 — this module only owns
//! the narrow "upgrade this already-accepted socket to TLS" touchpoint the
//! core needs.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::error::ConfigError;

/// Load a PEM certificate chain and private key into a `rustls` server
/// config, ready to hand to `TlsAcceptor`.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, ConfigError> {
    let cert_file = std::fs::File::open(cert_path)
        .map_err(|e| ConfigError::Certificate(format!("{}: {e}", cert_path.display())))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .map_err(|e| ConfigError::Certificate(format!("{}: {e}", cert_path.display())))?;

    let key_file = std::fs::File::open(key_path)
        .map_err(|e| ConfigError::Certificate(format!("{}: {e}", key_path.display())))?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| ConfigError::Certificate(format!("{}: {e}", key_path.display())))?
        .ok_or_else(|| ConfigError::Certificate(format!("{}: no private key found", key_path.display())))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ConfigError::Certificate(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Upgrade an accepted TCP socket to TLS using a previously loaded acceptor.
/// Only the Oracle listener calls this, and only when `tls_cert`/`tls_key`
/// are configured (§6).
pub async fn upgrade(acceptor: &TlsAcceptor, stream: TcpStream) -> std::io::Result<TlsStream<TcpStream>> {
    acceptor.accept(stream).await
}
