//! Server configuration

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::rtsp::transport::RtpTransport;

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// A connection must reach a negotiated session id within this window
    pub handshake_timeout: Duration,

    /// Pusher inactivity limit; UDP players get four times this
    pub keep_alive_timeout: Duration,

    /// Offer Basic instead of Digest when challenging
    pub auth_basic: bool,

    /// Pin the RTP transport; a client asking for anything else gets 461
    pub rtp_transport: Option<RtpTransport>,

    /// TTL for multicast RTP
    pub udp_ttl: u32,

    /// Emit a flow report for sessions that moved at least this many KB
    pub flow_threshold_kb: u64,

    /// Multicast group address pool
    pub multicast_range: (Ipv4Addr, Ipv4Addr),

    /// Enable TCP_NODELAY on accepted connections
    pub tcp_nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:554".parse().unwrap(),
            max_connections: 0, // Unlimited
            handshake_timeout: Duration::from_secs(15),
            keep_alive_timeout: Duration::from_secs(15),
            auth_basic: false,
            rtp_transport: None,
            udp_ttl: 64,
            flow_threshold_kb: 1024,
            multicast_range: (Ipv4Addr::new(239, 255, 0, 0), Ipv4Addr::new(239, 255, 255, 255)),
            tcp_nodelay: true,
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the handshake window
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the keep-alive window
    pub fn keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout = timeout;
        self
    }

    /// Challenge with Basic instead of Digest
    pub fn auth_basic(mut self, basic: bool) -> Self {
        self.auth_basic = basic;
        self
    }

    /// Pin the RTP transport
    pub fn rtp_transport(mut self, transport: RtpTransport) -> Self {
        self.rtp_transport = Some(transport);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();

        assert_eq!(config.bind_addr.port(), 554);
        assert_eq!(config.max_connections, 0);
        assert_eq!(config.handshake_timeout, Duration::from_secs(15));
        assert_eq!(config.keep_alive_timeout, Duration::from_secs(15));
        assert!(!config.auth_basic);
        assert!(config.rtp_transport.is_none());
        assert!(config.tcp_nodelay);
    }

    #[test]
    fn test_builder_chaining() {
        let addr: SocketAddr = "127.0.0.1:8554".parse().unwrap();
        let config = ServerConfig::default()
            .bind(addr)
            .max_connections(50)
            .handshake_timeout(Duration::from_secs(5))
            .keep_alive_timeout(Duration::from_secs(30))
            .auth_basic(true)
            .rtp_transport(RtpTransport::Tcp);

        assert_eq!(config.bind_addr, addr);
        assert_eq!(config.max_connections, 50);
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.keep_alive_timeout, Duration::from_secs(30));
        assert!(config.auth_basic);
        assert_eq!(config.rtp_transport, Some(RtpTransport::Tcp));
    }
}
