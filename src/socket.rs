//! The narrow socket interface a [`Host`](crate::host::Host) is built against.
//!
//! Kept as a trait so the transport can be driven by a real [`std::net::UdpSocket`] in
//! production and by an in-memory stand-in in tests (see `tests/` for router-thread-style
//! harnesses that simulate drops and latency without needing two real sockets).

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// A datagram socket a [`Host`](crate::host::Host) sends and receives through.
///
/// A `None` result from `recv_from` means "would block" (no datagram currently available),
/// not an error.
pub trait Socket {
    fn local_addr(&self) -> io::Result<SocketAddr>;
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

/// The production [`Socket`] implementation, backed directly by [`std::net::UdpSocket`].
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(UdpTransport { socket })
    }

    /// Wraps an already-configured socket (e.g. one connected via `connect()`, or shared between
    /// test harnesses).
    pub fn from_socket(socket: UdpSocket) -> Self {
        UdpTransport { socket }
    }
}

impl Socket for UdpTransport {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, target)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok(result) => Ok(Some(result)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_read_timeout(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn loopback_round_trip() {
        let a = UdpTransport::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).unwrap();
        let b = UdpTransport::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).unwrap();
        let b_addr = b.local_addr().unwrap();

        a.send_to(b"hello", b_addr).unwrap();

        b.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let mut buf = [0u8; 32];
        let (n, from) = b.recv_from(&mut buf).unwrap().expect("expected a datagram");
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[test]
    fn recv_would_block_returns_none() {
        let a = UdpTransport::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).unwrap();
        a.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        let mut buf = [0u8; 32];
        assert!(a.recv_from(&mut buf).unwrap().is_none());
    }
}
