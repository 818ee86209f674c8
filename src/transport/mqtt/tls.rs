//! TLS client configuration for the broker connection
//!
//! Built from up to three PEM files: a CA certificate to verify the broker,
//! and a client certificate and key for mutual authentication. When none of
//! them are configured no TLS configuration is produced and the transport
//! falls back to whatever the broker URL scheme asks for.

use rumqttc::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rumqttc::tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use std::fs;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// TLS material errors
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("No PEM certificates found in {0}")]
    NoCertificates(PathBuf),
    #[error("No private key found in {0}")]
    NoPrivateKey(PathBuf),
    #[error("Invalid CA certificate in {path}: {source}")]
    InvalidCa {
        path: PathBuf,
        #[source]
        source: rustls::Error,
    },
    #[error("Invalid client certificate or key: {0}")]
    InvalidClientAuth(#[source] rustls::Error),
    #[error("Client certificate and key must be configured together")]
    IncompleteClientAuth,
}

/// Build the TLS client configuration, `None` when no TLS material is set
///
/// Empty strings count as unset. Without a CA file the bundled web PKI roots
/// are trusted.
pub fn build_tls_config(
    ca_cert: &str,
    tls_cert: &str,
    tls_key: &str,
) -> Result<Option<ClientConfig>, TlsError> {
    if ca_cert.is_empty() && tls_cert.is_empty() && tls_key.is_empty() {
        return Ok(None);
    }
    if tls_cert.is_empty() != tls_key.is_empty() {
        return Err(TlsError::IncompleteClientAuth);
    }

    let roots = if ca_cert.is_empty() {
        default_root_store()
    } else {
        load_root_store(Path::new(ca_cert))?
    };
    let builder = ClientConfig::builder().with_root_certificates(roots);

    let config = if tls_cert.is_empty() {
        builder.with_no_client_auth()
    } else {
        let certs = load_certificates(Path::new(tls_cert))?;
        let key = load_private_key(Path::new(tls_key))?;
        builder
            .with_client_auth_cert(certs, key)
            .map_err(TlsError::InvalidClientAuth)?
    };

    Ok(Some(config))
}

fn default_root_store() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

fn load_root_store(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certificates(path)? {
        roots.add(cert).map_err(|source| TlsError::InvalidCa {
            path: path.to_path_buf(),
            source,
        })?;
    }
    debug!(path = %path.display(), certificates = roots.len(), "backend: loaded CA certificates");
    Ok(roots)
}

fn read_pem(path: &Path) -> Result<Vec<u8>, TlsError> {
    fs::read(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = read_pem(path)?;
    let mut reader = BufReader::new(pem.as_slice());
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem = read_pem(path)?;
    let mut reader = BufReader::new(pem.as_slice());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}
