//! UDP socket setup.

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, UdpSocket};

/// Create and configure the endpoint's UDP socket.
///
/// socket2 is used for the pieces std does not expose: kernel buffer
/// sizing and v6-only control. The socket stays in blocking mode; the
/// event loop bounds each wait with a read timeout derived from the next
/// connection timer.
pub fn create_udp_socket(
    bind: SocketAddr,
    recv_buffer_size: Option<usize>,
    send_buffer_size: Option<usize>,
) -> Result<UdpSocket> {
    let domain = match bind {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket =
        Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("creating UDP socket")?;

    socket
        .set_reuse_address(true)
        .context("setting SO_REUSEADDR")?;

    if let Some(size) = recv_buffer_size {
        socket
            .set_recv_buffer_size(size)
            .with_context(|| format!("setting SO_RCVBUF to {size}"))?;
    }
    if let Some(size) = send_buffer_size {
        socket
            .set_send_buffer_size(size)
            .with_context(|| format!("setting SO_SNDBUF to {size}"))?;
    }

    if let SocketAddr::V6(addr) = bind {
        socket
            .set_only_v6(!addr.ip().is_unspecified())
            .context("setting IPV6_V6ONLY")?;
    }

    socket
        .bind(&bind.into())
        .with_context(|| format!("binding UDP socket to {bind}"))?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral() {
        let socket = create_udp_socket("127.0.0.1:0".parse().unwrap(), None, None).unwrap();
        let addr = socket.local_addr().unwrap();
        assert_eq!(addr.ip(), "127.0.0.1".parse::<std::net::IpAddr>().unwrap());
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_buffer_size_configuration() {
        let socket =
            create_udp_socket("127.0.0.1:0".parse().unwrap(), Some(1 << 20), Some(1 << 20));
        assert!(socket.is_ok());
    }
}
