use crate::config::ServerConfig;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Owns the listening socket and numbers accepted connections.
///
/// `accept` waits at most the configured accept timeout so the caller can
/// check for shutdown between waits.
pub struct ConnectionAcceptor {
    listener: TcpListener,
    address: SocketAddr,
    connection_count: AtomicUsize,
}

impl ConnectionAcceptor {
    /// Bind to the address, backlog and accept timeout in `config`
    pub fn bind(config: &ServerConfig) -> io::Result<Self> {
        let socket_addr = config
            .socket_address()
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "No socket addresses found"))?;

        let socket = Self::create_socket(&socket_addr, config.backlog_size, config.accept_timeout)?;
        let listener: TcpListener = socket.into();
        let address = listener.local_addr()?;

        Ok(Self {
            listener,
            address,
            connection_count: AtomicUsize::new(0),
        })
    }

    /// Wait for the next connection.
    ///
    /// Returns `Ok(None)` when the accept timeout passes without one.
    pub fn accept(&self) -> io::Result<Option<(TcpStream, SocketAddr, usize)>> {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                let id = self.connection_count.fetch_add(1, Ordering::Relaxed);
                Ok(Some((stream, addr, id)))
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Get the local address this acceptor is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Number of connections accepted so far
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    /// Create a properly configured socket
    fn create_socket(addr: &SocketAddr, backlog: u32, accept_timeout: Duration) -> io::Result<Socket> {
        let domain = if addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;

        // SO_RCVTIMEO on a listening socket bounds accept()
        let timeout = Some(accept_timeout).filter(|t| !t.is_zero());
        socket.set_read_timeout(timeout)?;

        socket.bind(&SockAddr::from(*addr))?;
        socket.listen(backlog.min(i32::MAX as u32) as i32)?;

        Ok(socket)
    }
}
