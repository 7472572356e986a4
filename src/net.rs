//! Socket setup helpers: nonblocking mode, listener binding with
//! `SO_REUSEADDR`, and address resolution.
//!
//! IPv4 and DNS-name targets only; IPv6 is out of scope.
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Socket, Type};

use crate::error::{Error, Result};

/// Binds a listening socket with `SO_REUSEADDR` set before `bind`, and
/// wraps it for registration with a `mio::Poll`.
pub fn bind_listener(host: &str, port: u16) -> Result<TcpListener> {
    let addr = resolve_one(host, port)?;
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None).map_err(Error::Bind)?;
    socket.set_reuse_address(true).map_err(Error::Bind)?;
    socket.set_nonblocking(true).map_err(Error::Bind)?;
    socket.bind(&addr.into()).map_err(Error::Bind)?;
    socket.listen(1024).map_err(Error::Bind)?;
    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(Error::Bind)
}

/// Resolves `host` (an IPv4 literal or a DNS name) and opens a
/// non-blocking `connect()` to it. The caller registers the returned
/// stream for write-readiness to learn when the connect completes (or
/// failed).
pub fn connect_nonblocking(host: &str, port: u16) -> Result<TcpStream> {
    let addr = resolve_one(host, port)?;
    TcpStream::connect(addr).map_err(Error::Io)
}

/// A single blocking connect, used for the local side's one hop to its
/// configured Fakio server.
pub fn connect_blocking(host: &str, port: u16) -> Result<std::net::TcpStream> {
    let addr = resolve_one(host, port)?;
    std::net::TcpStream::connect(addr).map_err(Error::Io)
}

fn resolve_one(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(Error::Io)?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| Error::Config(format!("no IPv4 address for {host}")))
}

/// `TCP_NODELAY` on every accepted and outbound socket, matching the
/// original's `set_socket_option`.
pub fn set_nodelay(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)
}
