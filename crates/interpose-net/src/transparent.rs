//! Socket options for transparent interception.
//!
//! Intercepted TCP connections keep their original destination in conntrack
//! (`SO_ORIGINAL_DST`); with TPROXY the accepted socket's local address is
//! already the original destination. Intercepted UDP datagrams carry it as
//! `IP_ORIGDSTADDR` ancillary data once `IP_RECVORIGDSTADDR` is enabled.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::BorrowedFd;

/// Client address and original destination of the datagram at the head of a
/// socket's receive queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramOrigin {
    pub peer: SocketAddr,
    pub destination: Option<SocketAddr>,
}

/// Recovers where intercepted traffic was originally headed.
///
/// Implemented by [`SocketOptionLookup`] against the kernel; tests substitute
/// a fixed answer.
pub trait DestinationLookup: Send + Sync + fmt::Debug {
    /// Original destination of an accepted stream socket.
    fn stream_destination(&self, fd: BorrowedFd<'_>) -> io::Result<SocketAddr>;

    /// Peek the next datagram's origin without consuming it. Returns
    /// `WouldBlock` when the queue is empty.
    fn datagram_origin(&self, fd: BorrowedFd<'_>) -> io::Result<DatagramOrigin>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SocketOptionLookup;

impl DestinationLookup for SocketOptionLookup {
    fn stream_destination(&self, fd: BorrowedFd<'_>) -> io::Result<SocketAddr> {
        match original_dst(fd) {
            Ok(addr) => Ok(addr),
            Err(_) => socket2::SockRef::from(&fd)
                .local_addr()?
                .as_socket()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not an inet socket")),
        }
    }

    fn datagram_origin(&self, fd: BorrowedFd<'_>) -> io::Result<DatagramOrigin> {
        peek_datagram_origin(fd)
    }
}

/// Enable `IP_TRANSPARENT` so the socket may bind or accept foreign addresses.
#[cfg(target_os = "linux")]
pub fn set_transparent(socket: &socket2::Socket) -> io::Result<()> {
    socket.set_ip_transparent(true).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("failed to set IP_TRANSPARENT: {e} (requires CAP_NET_ADMIN)"),
        )
    })
}

#[cfg(not(target_os = "linux"))]
pub fn set_transparent(_socket: &socket2::Socket) -> io::Result<()> {
    Err(unsupported("IP_TRANSPARENT"))
}

/// Ask the kernel to attach `IP_ORIGDSTADDR` to received datagrams.
#[cfg(target_os = "linux")]
pub fn set_recv_original_dst(socket: &socket2::Socket) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let one: libc::c_int = 1;
    // SAFETY: `one` is a valid c_int for the duration of the call.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_IP,
            libc::IP_RECVORIGDSTADDR,
            (&one as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_recv_original_dst(_socket: &socket2::Socket) -> io::Result<()> {
    Err(unsupported("IP_RECVORIGDSTADDR"))
}

/// `SO_ORIGINAL_DST` for IPv4, falling back to `IP6T_SO_ORIGINAL_DST`.
#[cfg(target_os = "linux")]
pub fn original_dst(fd: BorrowedFd<'_>) -> io::Result<SocketAddr> {
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::os::fd::AsRawFd;

    let fd = fd.as_raw_fd();

    // SAFETY: the buffers are zeroed sockaddr structs whose sizes are passed
    // alongside them.
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            libc::SO_ORIGINAL_DST,
            (&mut addr as *mut libc::sockaddr_in).cast(),
            &mut len,
        )
    };
    if ret == 0 {
        let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        return Ok(SocketAddr::new(ip.into(), u16::from_be(addr.sin_port)));
    }

    let mut addr6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
    let mut len6 = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IPV6,
            libc::IP6T_SO_ORIGINAL_DST,
            (&mut addr6 as *mut libc::sockaddr_in6).cast(),
            &mut len6,
        )
    };
    if ret == 0 {
        let ip = Ipv6Addr::from(addr6.sin6_addr.s6_addr);
        return Ok(SocketAddr::new(ip.into(), u16::from_be(addr6.sin6_port)));
    }

    Err(io::Error::new(
        io::ErrorKind::NotFound,
        "no original destination (is iptables REDIRECT/TPROXY configured?)",
    ))
}

#[cfg(not(target_os = "linux"))]
pub fn original_dst(_fd: BorrowedFd<'_>) -> io::Result<SocketAddr> {
    Err(unsupported("SO_ORIGINAL_DST"))
}

/// `recvmsg(MSG_PEEK)` the head datagram, returning its sender and the
/// `IP_ORIGDSTADDR` control message if present.
#[cfg(target_os = "linux")]
pub fn peek_datagram_origin(fd: BorrowedFd<'_>) -> io::Result<DatagramOrigin> {
    use std::net::Ipv4Addr;
    use std::os::fd::AsRawFd;

    let mut byte = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: byte.as_mut_ptr().cast(),
        iov_len: byte.len(),
    };
    // u64 elements keep the control buffer aligned for cmsghdr.
    let mut control = [0u64; 16];
    // SAFETY: all-zero is a valid sockaddr_storage and msghdr.
    let mut name: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = (&mut name as *mut libc::sockaddr_storage).cast();
    msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = std::mem::size_of_val(&control) as _;

    // SAFETY: every pointer in `msg` refers to a live local buffer.
    let ret = unsafe { libc::recvmsg(fd.as_raw_fd(), &mut msg, libc::MSG_PEEK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: the kernel filled `name` and reported its length.
    let peer = unsafe { socket2::SockAddr::new(name, msg.msg_namelen) }
        .as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "datagram without inet sender"))?;

    let mut destination = None;
    // SAFETY: CMSG_* walk the control buffer the kernel just filled, bounded
    // by `msg_controllen`.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_IP && (*cmsg).cmsg_type == libc::IP_ORIGDSTADDR {
                let sin: libc::sockaddr_in = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<libc::sockaddr_in>());
                let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                destination = Some(SocketAddr::new(ip.into(), u16::from_be(sin.sin_port)));
                break;
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(DatagramOrigin { peer, destination })
}

#[cfg(not(target_os = "linux"))]
pub fn peek_datagram_origin(_fd: BorrowedFd<'_>) -> io::Result<DatagramOrigin> {
    Err(unsupported("IP_ORIGDSTADDR"))
}

#[cfg(not(target_os = "linux"))]
fn unsupported(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{what} is only available on Linux"),
    )
}
