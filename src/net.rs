// ABOUTME: Socket tuning shared by the server and the client
//
// Both ends disable send coalescing (TCP_NODELAY), enable keep-alive and size
// the kernel buffers to 128 KiB by default. The listener is built through
// socket2 so the same options apply before bind.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Default SO_RCVBUF / SO_SNDBUF size
pub const DEFAULT_SOCKET_BUFFER: usize = 128 * 1024;

/// Apply the stream options required on both ends of a packet connection
pub fn tune_stream(stream: &TcpStream, buffer_size: usize) -> io::Result<()> {
    stream.set_nodelay(true)?;

    let sock = SockRef::from(stream);
    sock.set_keepalive(true)?;
    sock.set_recv_buffer_size(buffer_size)?;
    sock.set_send_buffer_size(buffer_size)?;
    Ok(())
}

/// Build a non-blocking listener with address reuse, keep-alive and sized buffers
pub fn bind_listener(addr: SocketAddr, backlog: usize, buffer_size: usize) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_keepalive(true)?;
    socket.set_recv_buffer_size(buffer_size)?;
    socket.set_send_buffer_size(buffer_size)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);
    socket.listen(backlog)?;

    debug!(addr = %addr, backlog = backlog, "Listener bound");
    TcpListener::from_std(socket.into())
}

/// Resolve `host:port` to the first socket address
pub async fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no address found for {host}:{port}"),
            )
        })
}
