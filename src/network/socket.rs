//! UDP socket setup
//!
//! The client talks to its socket through [`DatagramSocket`] and obtains it
//! from a [`Connector`], so the state machine can run against in-memory
//! sockets as well as real ones.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use crate::error::NetworkError;

/// Operations the transport client needs from a connected datagram socket
pub trait DatagramSocket: Send + Sync + 'static {
    fn send(&self, buf: &[u8]) -> io::Result<usize>;

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Pending asynchronous error (e.g. from an ICMP report)
    fn take_error(&self) -> io::Result<Option<io::Error>>;
}

impl DatagramSocket for UdpSocket {
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        UdpSocket::send(self, buf)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        UdpSocket::recv(self, buf)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        UdpSocket::set_write_timeout(self, timeout)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        UdpSocket::set_read_timeout(self, timeout)
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        UdpSocket::take_error(self)
    }
}

/// Opens a socket connected to a target
pub trait Connector: Send + Sync + 'static {
    type Socket: DatagramSocket;

    fn open(&self, target: SocketAddr) -> io::Result<Self::Socket>;
}

/// Real UDP sockets bound to an ephemeral port
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpConnector;

impl Connector for UdpConnector {
    type Socket = UdpSocket;

    fn open(&self, target: SocketAddr) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::for_address(target), Type::DGRAM, Some(Protocol::UDP))?;

        let local: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        socket.bind(&local.into())?;

        // A connected UDP socket gets ICMP errors reported back on send/recv
        socket.connect(&target.into())?;

        Ok(socket.into())
    }
}

/// Resolve `host:port`, preferring IPv4
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, NetworkError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(NetworkError::AddressInvalid("empty host".into()));
    }

    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| NetworkError::AddressInvalid(format!("{host}: {e}")))?
        .collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| NetworkError::AddressInvalid(format!("{host}: no addresses")))
}

/// Create the receiving socket
pub fn bind_server_socket(
    addr: SocketAddr,
    recv_buffer_size: usize,
    read_timeout: Duration,
) -> Result<UdpSocket, NetworkError> {
    let bind_err = |e: io::Error| NetworkError::BindFailed(format!("{addr}: {e}"));

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;

    if let Err(e) = socket.set_recv_buffer_size(recv_buffer_size) {
        tracing::warn!("Could not set receive buffer to {} bytes: {}", recv_buffer_size, e);
    }

    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.set_read_timeout(Some(read_timeout)).map_err(bind_err)?;

    Ok(socket.into())
}
