//! Datagram socket abstraction shared by discovery and hole punching
//!
//! Both stages run over the same bound socket, one after the other. The
//! trait exists so tests can substitute silent or scripted sockets.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// A bound, connectionless datagram socket usable from several threads
pub trait DatagramSocket: Sync {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Receive one datagram, honoring the configured read timeout
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// `None` blocks indefinitely
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramSocket for UdpSocket {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, target)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        UdpSocket::set_read_timeout(self, timeout)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Whether a receive error only means "nothing arrived before the timeout"
///
/// Unix reports `WouldBlock`, Windows reports `TimedOut`.
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Bind the UDP socket used for one handshake run
pub fn bind(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr)?;
    log::info!("UDP socket bound to {}", socket.local_addr()?);
    Ok(socket)
}
