//! TLS-intercepting listener.
//!
//! Clients speak HTTP CONNECT, get `200 Connection Established`, then start
//! TLS. The listener answers with a certificate minted on the fly for the
//! host named in the CONNECT line, so the plaintext of the tunnel becomes
//! visible to the relay. The accepted endpoint carries the CONNECT target as
//! its destination.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use interpose_cert::CertificateMinter;
use interpose_core::io::ReplayStream;
use interpose_core::{DEFAULT_HANDSHAKE_TIMEOUT_SECS, DEFAULT_MAX_HEADER_BYTES};
use interpose_proto::CodecSpec;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::endpoint::{Capabilities, Endpoint};
use crate::error::EndpointError;
use crate::handshake::accept_connect;
use crate::socket::{TcpListenTemplate, accept_tcp};
use crate::template::{Accepted, Incoming, Listener, ListenerTemplate};
use crate::tls::{VersionRange, accept_tls, server_config_from_pem};
use crate::transport::StreamTransport;

#[derive(Clone)]
pub struct InterceptListenTemplate {
    pub tcp: TcpListenTemplate,
    pub minter: Arc<dyn CertificateMinter>,
    pub versions: VersionRange,
    pub handshake_timeout: Duration,
    pub max_head: usize,
}

impl fmt::Debug for InterceptListenTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptListenTemplate")
            .field("tcp", &self.tcp)
            .field("versions", &self.versions)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}

impl InterceptListenTemplate {
    pub fn new(tcp: TcpListenTemplate, minter: Arc<dyn CertificateMinter>) -> Self {
        Self {
            tcp,
            minter,
            versions: VersionRange::default(),
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            max_head: DEFAULT_MAX_HEADER_BYTES,
        }
    }
}

#[async_trait]
impl ListenerTemplate for InterceptListenTemplate {
    fn kind(&self) -> &'static str {
        "https-intercept-listen"
    }

    fn describe(&self) -> String {
        format!("https-intercept-listen {}", self.tcp.bind)
    }

    fn codec(&self) -> CodecSpec {
        self.tcp.codec
    }

    async fn bind(&self) -> Result<Box<dyn Listener>, EndpointError> {
        let listener = self.tcp.bind_tcp().await?;
        Ok(Box::new(InterceptListener {
            listener,
            template: self.clone(),
        }))
    }
}

pub struct InterceptListener {
    listener: TcpListener,
    template: InterceptListenTemplate,
}

/// CONNECT, mint, then TLS-accept with the minted certificate.
async fn intercept(
    mut stream: TcpStream,
    peer: SocketAddr,
    template: InterceptListenTemplate,
) -> Result<Accepted, EndpointError> {
    let (target, leftover) = accept_connect(&mut stream, template.max_head).await?;
    debug!(%peer, %target, "CONNECT accepted");

    let minter = template.minter.clone();
    let host = target.host.clone();
    let minted = tokio::task::spawn_blocking(move || minter.mint(&host))
        .await
        .map_err(|e| EndpointError::Handshake(format!("certificate minting aborted: {e}")))??;
    let config = server_config_from_pem(&minted.chain_pem(), &minted.key_pem, template.versions)?;

    let acceptor = TlsAcceptor::from(Arc::new(config));
    let tls = accept_tls(
        &acceptor,
        ReplayStream::new(leftover, stream),
        template.handshake_timeout,
    )
    .await?;
    let endpoint = Endpoint::from_transport(
        format!("https {peer} -> {target}"),
        Capabilities::DUPLEX,
        template.tcp.codec,
        Box::new(StreamTransport::new(tls)),
    );
    Ok(Accepted {
        endpoint,
        destination: Some(target),
    })
}

#[async_trait]
impl Listener for InterceptListener {
    async fn accept(&mut self) -> Result<Incoming, EndpointError> {
        let (stream, peer) = accept_tcp(&self.listener).await?;
        let template = self.template.clone();
        let timeout = template.handshake_timeout;
        Ok(Incoming {
            peer: Some(peer),
            label: format!("https {peer}"),
            handshake: Box::pin(async move {
                match tokio::time::timeout(timeout, intercept(stream, peer, template)).await {
                    Ok(result) => result,
                    Err(_) => Err(EndpointError::Timeout("https intercept handshake")),
                }
            }),
        })
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}
