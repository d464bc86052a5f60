//! TLS material loading and rustls configuration.
//!
//! Listeners and connectors only ever see the built `ServerConfig` /
//! `ClientConfig`. All configs pin the ring provider and TLS 1.3.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use thiserror::Error;

/// ALPN protocol id negotiated on QUIC connections.
pub const QUIC_ALPN: &[u8] = b"sluice";

/// Default expected server name.
pub const DEFAULT_SERVER_NAME: &str = "localhost";

/// Errors building TLS configuration.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("{0} not configured")]
    Missing(&'static str),

    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("invalid server name {0:?}")]
    InvalidServerName(String),

    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("unsupported quic crypto configuration: {0}")]
    Quic(String),
}

impl TlsError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            TlsError::Missing(_) => "tls_material_missing",
            TlsError::ReadFile { .. } => "tls_read_failed",
            TlsError::NoCertificates(_) => "tls_no_certificates",
            TlsError::NoPrivateKey(_) => "tls_no_private_key",
            TlsError::InvalidServerName(_) => "tls_invalid_server_name",
            TlsError::Rustls(_) => "tls_config_invalid",
            TlsError::Quic(_) => "quic_crypto_unsupported",
        }
    }
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::ReadFile {
            path: path.to_path_buf(),
            source,
        })
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

/// Server certificate chain and private key.
#[derive(Debug)]
pub struct ServerIdentity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl ServerIdentity {
    /// Build from an in-memory DER certificate and PKCS#8 key.
    pub fn from_der(cert_der: Vec<u8>, key_der: Vec<u8>) -> Self {
        Self {
            certs: vec![CertificateDer::from(cert_der)],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der)),
        }
    }

    /// Load a PEM certificate chain and private key.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        let certs = read_certs(cert_path)?;

        let mut reader = open(key_path)?;
        let key = rustls_pemfile::private_key(&mut reader)
            .map_err(|source| TlsError::ReadFile {
                path: key_path.to_path_buf(),
                source,
            })?
            .ok_or_else(|| TlsError::NoPrivateKey(key_path.to_path_buf()))?;

        Ok(Self { certs, key })
    }

    /// Build a TLS 1.3 server config, advertising `alpn` when given.
    pub fn server_config(&self, alpn: Option<&[u8]>) -> Result<Arc<ServerConfig>, TlsError> {
        let mut config = ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_no_client_auth()
            .with_single_cert(self.certs.clone(), self.key.clone_key())?;

        if let Some(alpn) = alpn {
            config.alpn_protocols = vec![alpn.to_vec()];
        }
        Ok(Arc::new(config))
    }
}

/// Trust roots used by the client to verify the server.
#[derive(Debug, Clone)]
pub struct TrustRoots {
    roots: RootCertStore,
}

impl TrustRoots {
    pub fn from_der(cert_der: Vec<u8>) -> Result<Self, TlsError> {
        let mut roots = RootCertStore::empty();
        roots.add(CertificateDer::from(cert_der))?;
        Ok(Self { roots })
    }

    /// Load every certificate in a PEM bundle as a trust anchor.
    pub fn from_pem_file(path: &Path) -> Result<Self, TlsError> {
        let mut roots = RootCertStore::empty();
        for cert in read_certs(path)? {
            roots.add(cert)?;
        }
        Ok(Self { roots })
    }

    /// Build a TLS 1.3 client config, offering `alpn` when given.
    pub fn client_config(&self, alpn: Option<&[u8]>) -> Result<Arc<ClientConfig>, TlsError> {
        let mut config = ClientConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_root_certificates(self.roots.clone())
            .with_no_client_auth();

        if let Some(alpn) = alpn {
            config.alpn_protocols = vec![alpn.to_vec()];
        }
        Ok(Arc::new(config))
    }
}

/// Parse an expected server name.
pub fn server_name(name: &str) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(name.to_string())
        .map_err(|_| TlsError::InvalidServerName(name.to_string()))
}
