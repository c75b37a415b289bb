//! Listening socket construction and accept draining.

use mio::net::{TcpListener, TcpStream};
use std::io;
use std::net::SocketAddr;

/// Accept backlog. Small on purpose: pending connections beyond it are the
/// kernel's problem, not ours.
const BACKLOG: i32 = 5;

/// One bound listening socket.
///
/// Bind failure (address in use, permission denied) fails fast at
/// construction; it is never retried.
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = socket2::Socket::new(
            match addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;

        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(BACKLOG)?;

        let std_listener: std::net::TcpListener = socket.into();
        let local_addr = std_listener.local_addr()?;
        Ok(Listener {
            inner: TcpListener::from_std(std_listener),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept()
    }

    pub fn source_mut(&mut self) -> &mut TcpListener {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = Listener::bind(addr).unwrap();
        assert_ne!(listener.local_addr().port(), 0);
    }

    #[test]
    fn test_accept_would_block_when_no_pending() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = Listener::bind(addr).unwrap();
        match listener.accept() {
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::WouldBlock),
            Ok(_) => panic!("no connection was pending"),
        }
    }
}
