//! Socket endpoints: TCP, UDP and Unix stream sockets.

mod tcp;
mod udp;
mod unix;

pub use tcp::{TcpListenTemplate, TcpListenerHandle, TcpTemplate};
pub use udp::{UdpListenTemplate, UdpListenerHandle, UdpTemplate};
pub use unix::{UnixAddress, UnixListenTemplate, UnixListenerHandle, UnixTemplate};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use interpose_core::Destination;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};

use crate::error::EndpointError;

/// Resolve a destination to its first socket address.
pub(crate) async fn resolve(dest: &Destination) -> Result<SocketAddr, EndpointError> {
    if let Some(addr) = dest.socket_addr() {
        return Ok(addr);
    }
    tokio::net::lookup_host((dest.host.as_str(), dest.port))
        .await
        .map_err(|e| EndpointError::resource("resolve", dest, e))?
        .next()
        .ok_or_else(|| {
            EndpointError::resource(
                "resolve",
                dest,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
            )
        })
}

/// Options applied to a socket before it binds.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SocketSetup {
    pub reuse_port: bool,
    pub transparent: bool,
    pub recv_original_dst: bool,
}

/// Create a non-blocking socket for `addr`'s family and bind it.
pub(crate) fn bound_socket(
    addr: SocketAddr,
    ty: Type,
    setup: SocketSetup,
) -> std::io::Result<Socket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let protocol = if ty == Type::DGRAM {
        Protocol::UDP
    } else {
        Protocol::TCP
    };
    let socket = Socket::new(domain, ty, Some(protocol))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if setup.reuse_port {
        socket.set_reuse_port(true)?;
    }
    if setup.transparent {
        interpose_net::transparent::set_transparent(&socket)?;
    }
    if setup.recv_original_dst {
        interpose_net::transparent::set_recv_original_dst(&socket)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

/// Accept the next TCP client with Nagle's algorithm disabled.
pub(crate) async fn accept_tcp(
    listener: &TcpListener,
) -> Result<(TcpStream, SocketAddr), EndpointError> {
    let (stream, peer) = listener.accept().await?;
    stream.set_nodelay(true)?;
    Ok((stream, peer))
}

/// Wildcard address of the same family as `peer`, on `port`.
pub(crate) fn unspecified_for(peer: &SocketAddr, port: u16) -> SocketAddr {
    let ip = match peer {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, port)
}
