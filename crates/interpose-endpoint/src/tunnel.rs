//! Client endpoints reached through an upstream proxy: HTTP CONNECT, SOCKS4
//! and SOCKS5. HTTP CONNECT may be followed by a TLS handshake with the
//! target.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use interpose_core::io::ReplayStream;
use interpose_core::{DEFAULT_HANDSHAKE_TIMEOUT_SECS, DEFAULT_MAX_HEADER_BYTES, Destination};
use interpose_proto::CodecSpec;
use tracing::debug;

use crate::error::EndpointError;
use crate::handshake;
use crate::socket::TcpTemplate;
use crate::template::{EndpointTemplate, TemplateOverrides};
use crate::tls::connect_tls;
use crate::transport::{StreamTransport, Transport};

/// How to ask the upstream proxy for a tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelProtocol {
    HttpConnect { user_agent: String },
    Socks4 { user_id: String },
    Socks5 { credentials: Option<(String, String)> },
}

impl TunnelProtocol {
    pub fn kind(&self) -> &'static str {
        match self {
            TunnelProtocol::HttpConnect { .. } => "http-connect",
            TunnelProtocol::Socks4 { .. } => "socks4",
            TunnelProtocol::Socks5 { .. } => "socks5",
        }
    }
}

/// TLS run with the target once the tunnel is open.
#[derive(Debug, Clone)]
pub struct TunnelTls {
    pub config: Arc<rustls::ClientConfig>,
    pub sni: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TunnelTemplate {
    /// Connection to the proxy itself.
    pub proxy: TcpTemplate,
    pub target: Destination,
    pub protocol: TunnelProtocol,
    pub tls: Option<TunnelTls>,
    pub handshake_timeout: Duration,
    pub codec: CodecSpec,
}

impl TunnelTemplate {
    pub fn new(proxy: TcpTemplate, target: Destination, protocol: TunnelProtocol) -> Self {
        Self {
            proxy,
            target,
            protocol,
            tls: None,
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            codec: CodecSpec::Passthrough,
        }
    }

    pub fn with_tls(mut self, tls: TunnelTls) -> Self {
        self.tls = Some(tls);
        self
    }

    async fn negotiate(
        &self,
        stream: &mut tokio::net::TcpStream,
    ) -> Result<bytes::Bytes, EndpointError> {
        match &self.protocol {
            TunnelProtocol::HttpConnect { user_agent } => {
                handshake::http_connect(stream, &self.target, user_agent, DEFAULT_MAX_HEADER_BYTES)
                    .await
            }
            TunnelProtocol::Socks4 { user_id } => {
                handshake::socks4_connect(stream, &self.target, user_id).await
            }
            TunnelProtocol::Socks5 { credentials } => {
                let credentials = credentials.as_ref().map(|(u, p)| (u.as_str(), p.as_str()));
                handshake::socks5_connect(stream, &self.target, credentials).await
            }
        }
    }
}

#[async_trait]
impl EndpointTemplate for TunnelTemplate {
    fn kind(&self) -> &'static str {
        self.protocol.kind()
    }

    fn describe(&self) -> String {
        format!("{} {} via {}", self.protocol.kind(), self.target, self.proxy.destination)
    }

    fn codec(&self) -> CodecSpec {
        self.codec
    }

    fn destination(&self) -> Option<&Destination> {
        Some(&self.target)
    }

    async fn open(&self) -> Result<Box<dyn Transport>, EndpointError> {
        let mut stream = self.proxy.connect_stream().await?;
        let leftover = match tokio::time::timeout(self.handshake_timeout, self.negotiate(&mut stream)).await {
            Ok(result) => result?,
            Err(_) => return Err(EndpointError::Timeout("proxy handshake")),
        };
        debug!(
            proxy = %self.proxy.destination,
            target = %self.target,
            protocol = self.protocol.kind(),
            "tunnel established"
        );
        let stream = ReplayStream::new(leftover, stream);
        match &self.tls {
            Some(tls) => {
                let sni = tls.sni.as_deref().unwrap_or(&self.target.host);
                let stream =
                    connect_tls(tls.config.clone(), sni, stream, self.handshake_timeout).await?;
                Ok(Box::new(StreamTransport::new(stream)))
            }
            None => Ok(Box::new(StreamTransport::new(stream))),
        }
    }

    /// Overrides retarget the tunnel; the proxy connection is unchanged
    /// except for its source port.
    fn with_overrides(
        &self,
        overrides: &TemplateOverrides,
    ) -> Result<Arc<dyn EndpointTemplate>, EndpointError> {
        let mut next = self.clone();
        if let Some(dest) = &overrides.destination {
            next.target = dest.clone();
            if let Some(tls) = &mut next.tls {
                tls.sni = None;
            }
        }
        next.proxy = self.proxy.apply(&TemplateOverrides {
            destination: None,
            source_port: overrides.source_port,
        });
        Ok(Arc::new(next))
    }
}
