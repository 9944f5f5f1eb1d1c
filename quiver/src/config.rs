//! Endpoint configuration.

use bytes::Bytes;
use quiver_quic::connection::ConnectionConfig;
use std::net::SocketAddr;

/// Configuration for one socket context and the connections it hosts.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Local address to bind the UDP socket to.
    pub bind: SocketAddr,
    /// Length of locally-issued connection IDs. Fixed per endpoint so
    /// short-header packets can be demultiplexed.
    pub cid_len: usize,
    /// Kernel receive buffer size (SO_RCVBUF), if overridden.
    pub socket_recv_buffer_size: Option<usize>,
    /// Kernel send buffer size (SO_SNDBUF), if overridden.
    pub socket_send_buffer_size: Option<usize>,
    /// ALPN protocols: offered in preference order (client), accepted
    /// (server).
    pub alpn: Vec<Vec<u8>>,
    /// PEM certificate chain; present on servers.
    pub cert_pem: Option<Bytes>,
    /// PEM private key; present on servers.
    pub key_pem: Option<Bytes>,
    /// Verify the server certificate (clients). Off for self-signed test
    /// deployments.
    pub verify_peer: bool,
    /// Per-connection transport configuration.
    pub connection: ConnectionConfig,
    /// Capacity of each connection's application event channel.
    pub event_channel_capacity: usize,
}

impl EndpointConfig {
    pub fn client(bind: SocketAddr) -> Self {
        Self {
            bind,
            cid_len: 8,
            socket_recv_buffer_size: None,
            socket_send_buffer_size: None,
            alpn: Vec::new(),
            cert_pem: None,
            key_pem: None,
            verify_peer: true,
            connection: ConnectionConfig::default(),
            event_channel_capacity: 64,
        }
    }

    pub fn server(bind: SocketAddr, cert_pem: Bytes, key_pem: Bytes) -> Self {
        Self {
            cert_pem: Some(cert_pem),
            key_pem: Some(key_pem),
            ..Self::client(bind)
        }
    }

    pub fn is_server(&self) -> bool {
        self.cert_pem.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_follows_certificate() {
        let client = EndpointConfig::client("127.0.0.1:0".parse().unwrap());
        assert!(!client.is_server());
        let server = EndpointConfig::server(
            "127.0.0.1:4433".parse().unwrap(),
            Bytes::from_static(b"cert"),
            Bytes::from_static(b"key"),
        );
        assert!(server.is_server());
        assert_eq!(server.cid_len, 8);
    }
}
