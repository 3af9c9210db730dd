/// Socket construction shared by both channels.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::warn;

use crate::protocol::SOCKET_BUFFER_SIZE;

/// Pending connections the listener will queue.
const LISTEN_BACKLOG: i32 = 16;

/// Create a UDP socket bound to `addr` with large OS buffers.
pub(crate) fn create_udp_socket(addr: SocketAddr, reuse_address: bool) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(false)?;
    if reuse_address {
        socket.set_reuse_address(true)?;
    }
    if let Err(e) = socket.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        warn!("Could not set UDP send buffer: {}", e);
    }
    if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        warn!("Could not set UDP receive buffer: {}", e);
    }
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Local wildcard address in the same family as `peer`, for outgoing sockets.
pub(crate) fn unspecified_for(peer: SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    }
}

/// Create a non-blocking TCP listener with `SO_REUSEADDR`.
pub(crate) fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Set socket options for throughput on a connected stream.
pub(crate) fn tune_stream(stream: &TcpStream) {
    let sock_ref = SockRef::from(stream);
    if let Err(e) = sock_ref.set_nodelay(true) {
        warn!("Could not set TCP_NODELAY: {}", e);
    }
    if let Err(e) = sock_ref.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        warn!("Could not set TCP send buffer: {}", e);
    }
    if let Err(e) = sock_ref.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        warn!("Could not set TCP receive buffer: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_socket_binds_ephemeral_port() {
        let sock = create_udp_socket("127.0.0.1:0".parse().unwrap(), true).unwrap();
        assert_ne!(sock.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn listener_is_non_blocking() {
        let listener = create_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn wildcard_matches_family() {
        assert!(unspecified_for("10.0.0.1:5".parse().unwrap()).is_ipv4());
        assert!(unspecified_for("[::1]:5".parse().unwrap()).is_ipv6());
    }
}
