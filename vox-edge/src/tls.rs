//! Client certificate material and the TLS dialer for the broker link.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::transport::{BoxStream, DialFuture, Dialer};

/// The three files the broker link needs: `<dir>/<prefix>ca.crt`, `<prefix>client.crt`,
/// `<prefix>client.key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl CertPaths {
    pub fn new(dir: &Path, prefix: &str) -> Self {
        Self {
            ca: dir.join(format!("{prefix}ca.crt")),
            cert: dir.join(format!("{prefix}client.crt")),
            key: dir.join(format!("{prefix}client.key")),
        }
    }

    /// Every path that does not exist, in ca / cert / key order.
    pub fn missing(&self) -> Vec<PathBuf> {
        [&self.ca, &self.cert, &self.key]
            .into_iter()
            .filter(|p| !p.exists())
            .cloned()
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("missing certificate files: {}", join_paths(.0))]
    Missing(Vec<PathBuf>),
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no certificates in {0}")]
    NoCertificates(PathBuf),
    #[error("no private key in {0}")]
    NoPrivateKey(PathBuf),
    #[error("invalid broker name {0:?}")]
    ServerName(String),
    #[error("tls: {0}")]
    Rustls(#[from] rustls::Error),
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load CA bundle, client chain and key, and build a mutually authenticated client config.
/// Never retried: any failure here is a startup error.
pub fn load_client_config(paths: &CertPaths) -> Result<ClientConfig, TlsError> {
    let missing = paths.missing();
    if !missing.is_empty() {
        return Err(TlsError::Missing(missing));
    }

    let mut roots = RootCertStore::empty();
    for cert in read_certs(&paths.ca)? {
        roots.add(cert)?;
    }
    let chain = read_certs(&paths.cert)?;
    let key = read_key(&paths.key)?;

    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_client_auth_cert(chain, key)?;
    debug!(ca = %paths.ca.display(), cert = %paths.cert.display(), "client tls config built");
    Ok(config)
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
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

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// Dials the broker over TCP and runs the TLS handshake.
pub struct TlsDialer {
    host: String,
    port: u16,
    server_name: ServerName<'static>,
    connector: TlsConnector,
}

impl TlsDialer {
    /// `server_name` is the name verified against the broker certificate.
    pub fn new(
        host: &str,
        port: u16,
        server_name: &str,
        config: ClientConfig,
    ) -> Result<Self, TlsError> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsError::ServerName(server_name.to_string()))?;
        Ok(Self {
            host: host.to_string(),
            port,
            server_name,
            connector: TlsConnector::from(Arc::new(config)),
        })
    }
}

impl Dialer for TlsDialer {
    fn dial(&self) -> DialFuture<'_> {
        Box::pin(async move {
            let tcp = TcpStream::connect((self.host.as_str(), self.port)).await?;
            tcp.set_nodelay(true)?;
            let stream = self
                .connector
                .connect(self.server_name.clone(), tcp)
                .await?;
            info!(host = %self.host, port = self.port, "tls handshake complete");
            Ok(Box::new(stream) as BoxStream)
        })
    }

    fn describe(&self) -> String {
        format!("{}:{} (tls)", self.host, self.port)
    }
}
