//! Socket primitives: non-blocking connect, listener setup, keepalive
//! tuning and shutdown.

use std::io::{self, ErrorKind};
use std::net::{self, Shutdown, SocketAddr};

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::TcpStream;

use crate::service::KeepaliveConfig;

fn keepalive(conf: &KeepaliveConfig) -> TcpKeepalive {
    let keepalive = TcpKeepalive::new().with_time(conf.idle());
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
    let keepalive = keepalive
        .with_interval(conf.interval())
        .with_retries(conf.count);
    keepalive
}

/// Start a non-blocking connect.
///
/// The returned stream is usually still connecting; completion is reported
/// by write readiness and the outcome by `take_error`.
pub fn connect_nonblocking(addr: SocketAddr, conf: &KeepaliveConfig) -> io::Result<net::TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    socket.set_keepalive(true)?;
    socket.set_tcp_keepalive(&keepalive(conf))?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(socket.into())
}

pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Accepted sockets do not inherit the listener's non-blocking flag.
pub fn tune_accepted(stream: &net::TcpStream, conf: &KeepaliveConfig) -> io::Result<()> {
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)?;
    let sock = SockRef::from(stream);
    sock.set_keepalive(true)?;
    sock.set_tcp_keepalive(&keepalive(conf))
}

/// Shut both directions down; the peer and our own reactor registration
/// observe it as end of stream.
pub fn shutdown(stream: &TcpStream) -> io::Result<()> {
    match SockRef::from(stream).shutdown(Shutdown::Both) {
        Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

/// Write the whole buffer, parking on write readiness whenever the socket
/// buffer is full.
pub async fn write_all(stream: &TcpStream, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        stream.writable().await?;
        match stream.try_write(buf) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
