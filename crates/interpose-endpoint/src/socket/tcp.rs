use std::net::SocketAddr;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use interpose_core::{DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_CONNECTION_BACKLOG, Destination};
use interpose_net::{DestinationLookup, SocketOptionLookup};
use interpose_proto::CodecSpec;
use socket2::Type;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, info};

use super::{SocketSetup, accept_tcp, bound_socket, resolve, unspecified_for};
use crate::endpoint::{Capabilities, Endpoint};
use crate::error::EndpointError;
use crate::template::{
    Accepted, EndpointTemplate, Incoming, Listener, ListenerTemplate, TemplateOverrides,
};
use crate::transport::{StreamTransport, Transport};

// ── Client ──

#[derive(Debug, Clone)]
pub struct TcpTemplate {
    pub destination: Destination,
    /// Bind this local port before connecting.
    pub source_port: Option<u16>,
    /// Set `IP_TRANSPARENT` so a foreign source address may be used.
    pub transparent: bool,
    pub nodelay: bool,
    pub connect_timeout: Duration,
    pub codec: CodecSpec,
}

impl TcpTemplate {
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            source_port: None,
            transparent: false,
            nodelay: true,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            codec: CodecSpec::Passthrough,
        }
    }

    pub fn with_codec(mut self, codec: CodecSpec) -> Self {
        self.codec = codec;
        self
    }

    pub(crate) fn apply(&self, overrides: &TemplateOverrides) -> Self {
        let mut next = self.clone();
        if let Some(dest) = &overrides.destination {
            next.destination = dest.clone();
        }
        if let Some(port) = overrides.source_port {
            next.source_port = Some(port);
        }
        next
    }

    /// Connect a raw TCP stream to `destination`.
    pub async fn connect_stream(&self) -> Result<TcpStream, EndpointError> {
        self.connect_to(&self.destination).await
    }

    /// Connect with this template's socket options to an arbitrary target.
    pub(crate) async fn connect_to(&self, target: &Destination) -> Result<TcpStream, EndpointError> {
        let addr = resolve(target).await?;
        let connect = async {
            let stream = if self.source_port.is_some() || self.transparent {
                let local = unspecified_for(&addr, self.source_port.unwrap_or(0));
                let setup = SocketSetup {
                    transparent: self.transparent,
                    ..Default::default()
                };
                let socket = bound_socket(local, Type::STREAM, setup)?;
                TcpSocket::from_std_stream(socket.into())
                    .connect(addr)
                    .await?
            } else {
                TcpStream::connect(addr).await?
            };
            stream.set_nodelay(self.nodelay)?;
            Ok::<_, std::io::Error>(stream)
        };
        match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(stream)) => {
                debug!(%target, %addr, "tcp connected");
                Ok(stream)
            }
            Ok(Err(e)) => Err(EndpointError::resource("connect to", target, e)),
            Err(_) => Err(EndpointError::Timeout("tcp connect")),
        }
    }
}

#[async_trait]
impl EndpointTemplate for TcpTemplate {
    fn kind(&self) -> &'static str {
        "tcp"
    }

    fn describe(&self) -> String {
        format!("tcp {}", self.destination)
    }

    fn codec(&self) -> CodecSpec {
        self.codec
    }

    fn destination(&self) -> Option<&Destination> {
        Some(&self.destination)
    }

    async fn open(&self) -> Result<Box<dyn Transport>, EndpointError> {
        let stream = self.connect_stream().await?;
        Ok(Box::new(StreamTransport::new(stream)))
    }

    fn with_overrides(
        &self,
        overrides: &TemplateOverrides,
    ) -> Result<Arc<dyn EndpointTemplate>, EndpointError> {
        Ok(Arc::new(self.apply(overrides)))
    }
}

// ── Listener ──

#[derive(Debug, Clone)]
pub struct TcpListenTemplate {
    pub bind: Destination,
    /// Set `IP_TRANSPARENT` so redirected connections can be accepted.
    pub transparent: bool,
    pub backlog: u32,
    pub codec: CodecSpec,
    /// Recovers the original destination of each accepted connection.
    pub lookup: Option<Arc<dyn DestinationLookup>>,
}

impl TcpListenTemplate {
    pub fn new(bind: Destination) -> Self {
        Self {
            bind,
            transparent: false,
            backlog: DEFAULT_CONNECTION_BACKLOG,
            codec: CodecSpec::Passthrough,
            lookup: None,
        }
    }

    /// Accept intercepted connections and report their original destination.
    pub fn transparent(mut self) -> Self {
        self.transparent = true;
        self.lookup = Some(Arc::new(SocketOptionLookup));
        self
    }

    pub fn with_codec(mut self, codec: CodecSpec) -> Self {
        self.codec = codec;
        self
    }

    /// Replace how original destinations are recovered.
    pub fn with_lookup(mut self, lookup: Arc<dyn DestinationLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    /// Bind the raw listening socket.
    pub async fn bind_tcp(&self) -> Result<TcpListener, EndpointError> {
        let addr = resolve(&self.bind).await?;
        let setup = SocketSetup {
            transparent: self.transparent,
            ..Default::default()
        };
        let listen = || -> std::io::Result<TcpListener> {
            let socket = bound_socket(addr, Type::STREAM, setup)?;
            socket.listen(self.backlog as i32)?;
            TcpListener::from_std(socket.into())
        };
        let listener = listen().map_err(|e| EndpointError::resource("bind", &self.bind, e))?;
        info!(addr = %listener.local_addr()?, transparent = self.transparent, "tcp listening");
        Ok(listener)
    }

    /// Original destination of an accepted connection, when a lookup is set.
    pub fn original_destination(&self, stream: &TcpStream) -> Option<Destination> {
        let lookup = self.lookup.as_ref()?;
        match lookup.stream_destination(stream.as_fd()) {
            Ok(addr) => Some(Destination::from(addr)),
            Err(e) => {
                debug!(error = %e, "original destination unavailable");
                None
            }
        }
    }
}

#[async_trait]
impl ListenerTemplate for TcpListenTemplate {
    fn kind(&self) -> &'static str {
        "tcp-listen"
    }

    fn describe(&self) -> String {
        format!("tcp-listen {}", self.bind)
    }

    fn codec(&self) -> CodecSpec {
        self.codec
    }

    async fn bind(&self) -> Result<Box<dyn Listener>, EndpointError> {
        let listener = self.bind_tcp().await?;
        Ok(Box::new(TcpListenerHandle {
            listener,
            template: self.clone(),
        }))
    }
}

pub struct TcpListenerHandle {
    listener: TcpListener,
    template: TcpListenTemplate,
}

#[async_trait]
impl Listener for TcpListenerHandle {
    async fn accept(&mut self) -> Result<Incoming, EndpointError> {
        let (stream, peer) = accept_tcp(&self.listener).await?;
        let destination = self.template.original_destination(&stream);
        let endpoint = Endpoint::from_transport(
            format!("tcp {peer}"),
            Capabilities::DUPLEX,
            self.template.codec,
            Box::new(StreamTransport::new(stream)),
        );
        Ok(Incoming::ready(Some(peer), Accepted { endpoint, destination }))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}
