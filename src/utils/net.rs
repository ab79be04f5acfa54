//! Socket helpers for the LAN mesh transport.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, OwnedFd};

use nix::sys::socket::{
    bind, setsockopt, socket, sockopt, AddressFamily, SockFlag, SockProtocol, SockType,
    SockaddrIn, SockaddrIn6,
};

/// Receive buffer requested for mesh sockets; a talk burst arrives at once
const RECV_BUFFER_BYTES: usize = 256 * 1024;

fn nix_io<T>(result: nix::Result<T>) -> io::Result<T> {
    result.map_err(io::Error::from)
}

fn new_datagram_fd(addr: &SocketAddr) -> io::Result<OwnedFd> {
    let family = if addr.is_ipv4() {
        AddressFamily::Inet
    } else {
        AddressFamily::Inet6
    };
    nix_io(socket(
        family,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        SockProtocol::Udp,
    ))
}

/// Bind a non-blocking UDP socket able to send and receive broadcast datagrams.
///
/// Address and port reuse are enabled so several peers on one host can share
/// the mesh port.
pub fn bind_udp_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let fd = new_datagram_fd(&addr)?;
    nix_io(setsockopt(&fd, sockopt::ReuseAddr, &true))?;
    nix_io(setsockopt(&fd, sockopt::ReusePort, &true))?;
    // best effort; the kernel clamps to rmem_max
    let _ = setsockopt(&fd, sockopt::RcvBuf, &RECV_BUFFER_BYTES);

    match addr {
        SocketAddr::V4(v4) => {
            nix_io(setsockopt(&fd, sockopt::Broadcast, &true))?;
            nix_io(bind(fd.as_raw_fd(), &SockaddrIn::from(v4)))?;
        }
        SocketAddr::V6(v6) => {
            // no broadcast on v6; keep the socket v6-only so a v4 peer can share the port
            nix_io(setsockopt(&fd, sockopt::Ipv6V6Only, &true))?;
            nix_io(bind(fd.as_raw_fd(), &SockaddrIn6::from(v6)))?;
        }
    }

    let socket = UdpSocket::from(fd);
    socket.set_nonblocking(true)?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral_v4() {
        let socket = bind_udp_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(socket.local_addr().unwrap().port() > 0);
    }

    #[test]
    fn test_socket_is_non_blocking_and_usable() {
        let socket = bind_udp_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut buf = [0u8; 16];
        let err = socket.recv_from(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        let addr = socket.local_addr().unwrap();
        socket.send_to(b"hi", addr).unwrap();
        // loopback delivery is not instantaneous
        let (n, from) = loop {
            match socket.recv_from(&mut buf) {
                Ok(got) => break got,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(1))
                }
                Err(e) => panic!("recv failed: {}", e),
            }
        };
        assert_eq!(&buf[..n], b"hi");
        assert_eq!(from, addr);
    }

    #[test]
    fn test_two_sockets_share_a_port() {
        let first = bind_udp_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        let port = first.local_addr().unwrap().port();
        let second = bind_udp_socket(SocketAddr::from(([127, 0, 0, 1], port)));
        assert!(second.is_ok());
    }
}
