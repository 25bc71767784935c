use std::net::SocketAddr;
use std::os::fd::AsFd;
use std::sync::Arc;

use async_trait::async_trait;
use interpose_core::Destination;
use interpose_net::{DatagramOrigin, DestinationLookup, SocketOptionLookup};
use interpose_proto::CodecSpec;
use socket2::Type;
use tokio::io::Interest;
use tokio::net::UdpSocket;
use tracing::{debug, info};

use super::{SocketSetup, bound_socket, resolve, unspecified_for};
use crate::endpoint::{Capabilities, Endpoint};
use crate::error::EndpointError;
use crate::template::{
    Accepted, EndpointTemplate, Incoming, Listener, ListenerTemplate, TemplateOverrides,
};
use crate::transport::{DatagramTransport, Transport};

// ── Client ──

#[derive(Debug, Clone)]
pub struct UdpTemplate {
    pub destination: Destination,
    pub source_port: Option<u16>,
    pub transparent: bool,
    pub codec: CodecSpec,
}

impl UdpTemplate {
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            source_port: None,
            transparent: false,
            codec: CodecSpec::Passthrough,
        }
    }
}

#[async_trait]
impl EndpointTemplate for UdpTemplate {
    fn kind(&self) -> &'static str {
        "udp"
    }

    fn describe(&self) -> String {
        format!("udp {}", self.destination)
    }

    fn codec(&self) -> CodecSpec {
        self.codec
    }

    fn destination(&self) -> Option<&Destination> {
        Some(&self.destination)
    }

    async fn open(&self) -> Result<Box<dyn Transport>, EndpointError> {
        let addr = resolve(&self.destination).await?;
        let local = unspecified_for(&addr, self.source_port.unwrap_or(0));
        let setup = SocketSetup {
            transparent: self.transparent,
            ..Default::default()
        };
        let open = async {
            let socket = UdpSocket::from_std(bound_socket(local, Type::DGRAM, setup)?.into())?;
            socket.connect(addr).await?;
            Ok::<_, std::io::Error>(socket)
        };
        let socket = open
            .await
            .map_err(|e| EndpointError::resource("connect to", &self.destination, e))?;
        debug!(destination = %self.destination, "udp connected");
        Ok(Box::new(DatagramTransport::new(socket)))
    }

    fn with_overrides(
        &self,
        overrides: &TemplateOverrides,
    ) -> Result<Arc<dyn EndpointTemplate>, EndpointError> {
        let mut next = self.clone();
        if let Some(dest) = &overrides.destination {
            next.destination = dest.clone();
        }
        if let Some(port) = overrides.source_port {
            next.source_port = Some(port);
        }
        Ok(Arc::new(next))
    }
}

// ── Listener ──

/// UDP "server": each new peer gets the listening socket, connected to it,
/// and a fresh socket is bound to the same address for the next peer.
#[derive(Debug, Clone)]
pub struct UdpListenTemplate {
    pub bind: Destination,
    pub transparent: bool,
    pub codec: CodecSpec,
    /// Reads each first datagram's original destination.
    pub lookup: Option<Arc<dyn DestinationLookup>>,
}

impl UdpListenTemplate {
    pub fn new(bind: Destination) -> Self {
        Self {
            bind,
            transparent: false,
            codec: CodecSpec::Passthrough,
            lookup: None,
        }
    }

    /// Accept redirected datagrams and report their original destination.
    pub fn transparent(mut self) -> Self {
        self.transparent = true;
        self.lookup = Some(Arc::new(SocketOptionLookup));
        self
    }

    pub fn with_lookup(mut self, lookup: Arc<dyn DestinationLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    fn bind_socket(&self, addr: SocketAddr) -> std::io::Result<UdpSocket> {
        let setup = SocketSetup {
            reuse_port: true,
            transparent: self.transparent,
            recv_original_dst: self.transparent,
        };
        UdpSocket::from_std(bound_socket(addr, Type::DGRAM, setup)?.into())
    }
}

#[async_trait]
impl ListenerTemplate for UdpListenTemplate {
    fn kind(&self) -> &'static str {
        "udp-listen"
    }

    fn describe(&self) -> String {
        format!("udp-listen {}", self.bind)
    }

    fn codec(&self) -> CodecSpec {
        self.codec
    }

    async fn bind(&self) -> Result<Box<dyn Listener>, EndpointError> {
        let addr = resolve(&self.bind).await?;
        let socket = self
            .bind_socket(addr)
            .map_err(|e| EndpointError::resource("bind", &self.bind, e))?;
        let local = socket.local_addr()?;
        info!(addr = %local, transparent = self.transparent, "udp listening");
        Ok(Box::new(UdpListenerHandle {
            socket,
            local,
            template: self.clone(),
        }))
    }
}

pub struct UdpListenerHandle {
    socket: UdpSocket,
    local: SocketAddr,
    template: UdpListenTemplate,
}

impl UdpListenerHandle {
    async fn peek_origin(&self) -> std::io::Result<DatagramOrigin> {
        if let Some(lookup) = &self.template.lookup {
            self.socket
                .async_io(Interest::READABLE, || lookup.datagram_origin(self.socket.as_fd()))
                .await
        } else {
            let mut byte = [0u8; 1];
            let (_, peer) = self.socket.peek_from(&mut byte).await?;
            Ok(DatagramOrigin {
                peer,
                destination: None,
            })
        }
    }
}

#[async_trait]
impl Listener for UdpListenerHandle {
    async fn accept(&mut self) -> Result<Incoming, EndpointError> {
        let origin = self.peek_origin().await?;
        let fresh = self
            .template
            .bind_socket(self.local)
            .map_err(|e| EndpointError::resource("bind", self.local, e))?;
        let socket = std::mem::replace(&mut self.socket, fresh);
        socket.connect(origin.peer).await?;
        debug!(peer = %origin.peer, "udp peer accepted");

        let endpoint = Endpoint::from_transport(
            format!("udp {}", origin.peer),
            Capabilities::DUPLEX,
            self.template.codec,
            Box::new(DatagramTransport::new(socket)),
        );
        Ok(Incoming::ready(
            Some(origin.peer),
            Accepted {
                endpoint,
                destination: origin.destination.map(Destination::from),
            },
        ))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }
}
