//! TLS endpoints.
//!
//! - [`TlsTemplate`]: TLS client over a TCP connection, with configurable
//!   verification and SNI.
//! - [`TlsListenTemplate`]: TLS server with a file-based or auto-generated
//!   certificate. The handshake runs in the connection's own task.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use interpose_core::{DEFAULT_HANDSHAKE_TIMEOUT_SECS, Destination};
use interpose_proto::CodecSpec;
use rcgen::{CertificateParams, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::{TlsAcceptor, TlsConnector, client, server};
use tracing::debug;

use crate::endpoint::{Capabilities, Endpoint};
use crate::error::EndpointError;
use crate::socket::{TcpListenTemplate, TcpTemplate, accept_tcp};
use crate::template::{
    Accepted, EndpointTemplate, Incoming, Listener, ListenerTemplate, TemplateOverrides,
};
use crate::transport::{StreamTransport, Transport};

pub type CertChain = Vec<CertificateDer<'static>>;

// ── Protocol versions ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl TlsVersion {
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        match s.to_ascii_lowercase().replace(['.', '_', 'v'], "").as_str() {
            "tls12" => Ok(TlsVersion::Tls12),
            "tls13" => Ok(TlsVersion::Tls13),
            _ => Err(EndpointError::Config(format!("unsupported TLS version '{s}'"))),
        }
    }
}

/// Protocol versions in `min..=max`.
pub fn protocol_versions(
    min: TlsVersion,
    max: TlsVersion,
) -> Result<Vec<&'static rustls::SupportedProtocolVersion>, EndpointError> {
    if min > max {
        return Err(EndpointError::Config(format!(
            "TLS min version {min:?} is above max version {max:?}"
        )));
    }
    let mut versions = Vec::with_capacity(2);
    if min <= TlsVersion::Tls13 && max >= TlsVersion::Tls13 {
        versions.push(&rustls::version::TLS13);
    }
    if min <= TlsVersion::Tls12 {
        versions.push(&rustls::version::TLS12);
    }
    Ok(versions)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRange {
    pub min: TlsVersion,
    pub max: TlsVersion,
}

impl Default for VersionRange {
    fn default() -> Self {
        Self {
            min: TlsVersion::Tls12,
            max: TlsVersion::Tls13,
        }
    }
}

// ── Server ──

/// Server config from PEM files, or an ephemeral self-signed certificate.
pub fn build_server_config(
    identity: Option<(&Path, &Path)>,
    versions: VersionRange,
) -> Result<rustls::ServerConfig, EndpointError> {
    let (certs, key) = match identity {
        Some((cert, key)) => load_cert_files(cert, key)?,
        None => generate_self_signed()?,
    };
    server_config(certs, key, versions)
}

/// Server config from an in-memory certificate chain and key.
pub fn server_config_from_pem(
    chain_pem: &str,
    key_pem: &str,
    versions: VersionRange,
) -> Result<rustls::ServerConfig, EndpointError> {
    let certs = parse_certs(chain_pem.as_bytes(), "minted certificate")?;
    let key = parse_key(key_pem.as_bytes(), "minted key")?;
    server_config(certs, key, versions)
}

fn server_config(
    certs: CertChain,
    key: PrivateKeyDer<'static>,
    versions: VersionRange,
) -> Result<rustls::ServerConfig, EndpointError> {
    let config = rustls::ServerConfig::builder_with_protocol_versions(&protocol_versions(
        versions.min,
        versions.max,
    )?)
    .with_no_client_auth()
    .with_single_cert(certs, key)?;
    Ok(config)
}

/// Generate a self-signed certificate in memory using rcgen.
fn generate_self_signed() -> Result<(CertChain, PrivateKeyDer<'static>), EndpointError> {
    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
        .map_err(|e| EndpointError::Config(format!("key generation failed: {e}")))?;
    let params = CertificateParams::new(vec!["localhost".to_string()])
        .map_err(|e| EndpointError::Config(format!("certificate params: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| EndpointError::Config(format!("certificate generation failed: {e}")))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok((vec![cert_der], key_der))
}

/// Load certificate chain and private key from PEM files.
pub fn load_cert_files(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(CertChain, PrivateKeyDer<'static>), EndpointError> {
    let read = |path: &Path| {
        std::fs::read(path).map_err(|e| EndpointError::resource("read", path.display(), e))
    };
    let certs = parse_certs(&read(cert_path)?, &cert_path.display().to_string())?;
    let key = parse_key(&read(key_path)?, &key_path.display().to_string())?;
    Ok((certs, key))
}

fn parse_certs(mut pem: &[u8], origin: &str) -> Result<CertChain, EndpointError> {
    let certs: CertChain = rustls_pemfile::certs(&mut pem)
        .filter_map(|c| c.ok().map(|v| v.into_owned()))
        .collect();
    if certs.is_empty() {
        return Err(EndpointError::Config(format!("no certificates found in {origin}")));
    }
    Ok(certs)
}

fn parse_key(mut pem: &[u8], origin: &str) -> Result<PrivateKeyDer<'static>, EndpointError> {
    rustls_pemfile::private_key(&mut pem)?
        .ok_or_else(|| EndpointError::Config(format!("no private key found in {origin}")))
}

// ── Client ──

/// How a TLS client checks the server certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Verification {
    /// Accept any certificate; interception targets rarely have trusted ones.
    #[default]
    Insecure,
    /// Mozilla's root store.
    WebPki,
    /// A PEM bundle of trusted roots.
    CaFile(PathBuf),
}

pub fn build_client_config(
    verification: &Verification,
    identity: Option<(&Path, &Path)>,
    versions: VersionRange,
) -> Result<rustls::ClientConfig, EndpointError> {
    let builder = rustls::ClientConfig::builder_with_protocol_versions(&protocol_versions(
        versions.min,
        versions.max,
    )?);
    let builder = match verification {
        Verification::Insecure => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier)),
        Verification::WebPki => {
            let roots = rustls::RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            builder.with_root_certificates(roots)
        }
        Verification::CaFile(path) => {
            let pem = std::fs::read(path).map_err(|e| EndpointError::resource("read", path.display(), e))?;
            let mut roots = rustls::RootCertStore::empty();
            for cert in parse_certs(&pem, &path.display().to_string())? {
                roots.add(cert)?;
            }
            builder.with_root_certificates(roots)
        }
    };
    let config = match identity {
        Some((cert, key)) => {
            let (certs, key) = load_cert_files(cert, key)?;
            builder.with_client_auth_cert(certs, key)?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(config)
}

/// Run a client handshake over `stream`.
pub async fn connect_tls<S>(
    config: Arc<rustls::ClientConfig>,
    sni: &str,
    stream: S,
    timeout: Duration,
) -> Result<client::TlsStream<S>, EndpointError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_name = ServerName::try_from(sni.to_string())
        .map_err(|e| EndpointError::Config(format!("invalid SNI '{sni}': {e}")))?;
    let connector = TlsConnector::from(config);
    match tokio::time::timeout(timeout, connector.connect(server_name, stream)).await {
        Ok(Ok(tls)) => Ok(tls),
        Ok(Err(e)) => Err(EndpointError::Handshake(format!("tls connect to {sni}: {e}"))),
        Err(_) => Err(EndpointError::Timeout("tls handshake")),
    }
}

/// Run a server handshake over `stream`.
pub async fn accept_tls<S>(
    acceptor: &TlsAcceptor,
    stream: S,
    timeout: Duration,
) -> Result<server::TlsStream<S>, EndpointError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(timeout, acceptor.accept(stream)).await {
        Ok(Ok(tls)) => Ok(tls),
        Ok(Err(e)) => Err(EndpointError::Handshake(format!("tls accept: {e}"))),
        Err(_) => Err(EndpointError::Timeout("tls handshake")),
    }
}

#[derive(Debug, Clone)]
pub struct TlsTemplate {
    pub tcp: TcpTemplate,
    pub config: Arc<rustls::ClientConfig>,
    /// Defaults to the destination host.
    pub sni: Option<String>,
    pub handshake_timeout: Duration,
}

impl TlsTemplate {
    pub fn new(tcp: TcpTemplate, config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            tcp,
            config,
            sni: None,
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
        }
    }

    pub fn sni(&self) -> &str {
        self.sni.as_deref().unwrap_or(&self.tcp.destination.host)
    }
}

#[async_trait]
impl EndpointTemplate for TlsTemplate {
    fn kind(&self) -> &'static str {
        "tls"
    }

    fn describe(&self) -> String {
        format!("tls {}", self.tcp.destination)
    }

    fn codec(&self) -> CodecSpec {
        self.tcp.codec
    }

    fn destination(&self) -> Option<&Destination> {
        Some(&self.tcp.destination)
    }

    async fn open(&self) -> Result<Box<dyn Transport>, EndpointError> {
        let tcp = self.tcp.connect_stream().await?;
        let tls = connect_tls(self.config.clone(), self.sni(), tcp, self.handshake_timeout).await?;
        debug!(destination = %self.tcp.destination, sni = %self.sni(), "tls established");
        Ok(Box::new(StreamTransport::new(tls)))
    }

    fn with_overrides(
        &self,
        overrides: &TemplateOverrides,
    ) -> Result<Arc<dyn EndpointTemplate>, EndpointError> {
        let mut next = self.clone();
        next.tcp = self.tcp.apply(overrides);
        // An explicit SNI only makes sense for the original destination.
        if overrides.destination.is_some() {
            next.sni = None;
        }
        Ok(Arc::new(next))
    }
}

// ── Listener ──

#[derive(Debug, Clone)]
pub struct TlsListenTemplate {
    pub tcp: TcpListenTemplate,
    pub config: Arc<rustls::ServerConfig>,
    pub handshake_timeout: Duration,
}

impl TlsListenTemplate {
    pub fn new(tcp: TcpListenTemplate, config: Arc<rustls::ServerConfig>) -> Self {
        Self {
            tcp,
            config,
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
        }
    }
}

#[async_trait]
impl ListenerTemplate for TlsListenTemplate {
    fn kind(&self) -> &'static str {
        "tls-listen"
    }

    fn describe(&self) -> String {
        format!("tls-listen {}", self.tcp.bind)
    }

    fn codec(&self) -> CodecSpec {
        self.tcp.codec
    }

    async fn bind(&self) -> Result<Box<dyn Listener>, EndpointError> {
        let listener = self.tcp.bind_tcp().await?;
        Ok(Box::new(TlsListenerHandle {
            listener,
            acceptor: TlsAcceptor::from(self.config.clone()),
            template: self.clone(),
        }))
    }
}

pub struct TlsListenerHandle {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    template: TlsListenTemplate,
}

#[async_trait]
impl Listener for TlsListenerHandle {
    async fn accept(&mut self) -> Result<Incoming, EndpointError> {
        let (stream, peer) = accept_tcp(&self.listener).await?;
        let destination = self.template.tcp.original_destination(&stream);
        let acceptor = self.acceptor.clone();
        let timeout = self.template.handshake_timeout;
        let codec = self.template.tcp.codec;
        Ok(Incoming {
            peer: Some(peer),
            label: format!("tls {peer}"),
            handshake: Box::pin(async move {
                let tls = accept_tls(&acceptor, stream, timeout).await?;
                let endpoint = Endpoint::from_transport(
                    format!("tls {peer}"),
                    Capabilities::DUPLEX,
                    codec,
                    Box::new(StreamTransport::new(tls)),
                );
                Ok(Accepted {
                    endpoint,
                    destination,
                })
            }),
        })
    }

    fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.local_addr().ok()
    }
}

/// A TLS certificate verifier that accepts any certificate.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parsing() {
        assert_eq!(TlsVersion::parse("TLSv1_2").unwrap(), TlsVersion::Tls12);
        assert_eq!(TlsVersion::parse("tls1.3").unwrap(), TlsVersion::Tls13);
        assert!(TlsVersion::parse("ssl3").is_err());
    }

    #[test]
    fn test_protocol_versions_range() {
        assert_eq!(protocol_versions(TlsVersion::Tls12, TlsVersion::Tls13).unwrap().len(), 2);
        let only13 = protocol_versions(TlsVersion::Tls13, TlsVersion::Tls13).unwrap();
        assert_eq!(only13.len(), 1);
        assert_eq!(only13[0].version, rustls::ProtocolVersion::TLSv1_3);
        let only12 = protocol_versions(TlsVersion::Tls12, TlsVersion::Tls12).unwrap();
        assert_eq!(only12[0].version, rustls::ProtocolVersion::TLSv1_2);
        assert!(protocol_versions(TlsVersion::Tls13, TlsVersion::Tls12).is_err());
    }

    #[test]
    fn test_self_signed_server_config() {
        assert!(build_server_config(None, VersionRange::default()).is_ok());
    }

    #[test]
    fn test_missing_key_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "").unwrap();
        std::fs::write(&key, "").unwrap();
        assert!(matches!(load_cert_files(&cert, &key), Err(EndpointError::Config(_))));
    }
}
