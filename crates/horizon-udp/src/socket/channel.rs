//! The non-blocking primary endpoint of a socket.

use std::io;
use std::net::{SocketAddr, UdpSocket as StdUdpSocket};

use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};

/// Primary endpoint of a socket across its lifecycle.
///
/// Before bind the endpoint is a plain non-blocking OS socket so options can be
/// applied; bind turns it into a `mio` socket the event loop can register.
pub(super) enum Channel {
    Unbound { socket: StdUdpSocket, ipv6: bool },
    Bound(mio::net::UdpSocket),
    Closed,
}

impl Channel {
    /// Open a fresh unbound, non-blocking UDP socket.
    pub(super) fn open(ipv6: bool) -> io::Result<StdUdpSocket> {
        let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    }

    /// Enable address reuse and bind `socket` to `addr`.
    pub(super) fn bind_reusable(socket: &StdUdpSocket, addr: SocketAddr) -> io::Result<()> {
        let sock = SockRef::from(socket);
        sock.set_reuse_address(true)?;
        sock.bind(&SockAddr::from(addr))
    }

    /// Borrow the OS socket for option calls.
    pub(super) fn sock_ref(&self) -> io::Result<SockRef<'_>> {
        match self {
            Channel::Unbound { socket, .. } => Ok(SockRef::from(socket)),
            Channel::Bound(socket) => Ok(SockRef::from(socket)),
            Channel::Closed => Err(closed()),
        }
    }

    pub(super) fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Channel::Bound(socket) => socket.local_addr().ok(),
            _ => None,
        }
    }

    pub(super) fn is_ipv6(&self) -> bool {
        match self {
            Channel::Unbound { ipv6, .. } => *ipv6,
            Channel::Bound(socket) => socket.local_addr().map(|a| a.is_ipv6()).unwrap_or(false),
            Channel::Closed => false,
        }
    }

    pub(super) fn bound_mut(&mut self) -> io::Result<&mut mio::net::UdpSocket> {
        match self {
            Channel::Bound(socket) => Ok(socket),
            Channel::Unbound { .. } => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "socket is not bound",
            )),
            Channel::Closed => Err(closed()),
        }
    }
}

/// Apply the same size to the receive and send buffers.
pub(super) fn set_buffer_sizes(sock: &SockRef<'_>, size: usize) -> io::Result<()> {
    sock.set_recv_buffer_size(size)?;
    sock.set_send_buffer_size(size)
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket is closed")
}
