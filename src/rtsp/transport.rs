//! Transport negotiation
//!
//! SETUP carries a `Transport` header describing how the client wants RTP.
//! Three modes are supported: interleaved TCP, unicast UDP with a separate
//! socket pair per track, and shared UDP multicast.

use std::io;
use std::net::IpAddr;

use tokio::net::UdpSocket;

/// Negotiated RTP delivery mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtpTransport {
    Tcp,
    Udp,
    Multicast,
}

impl std::fmt::Display for RtpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RtpTransport::Tcp => "TCP",
            RtpTransport::Udp => "UDP",
            RtpTransport::Multicast => "MULTICAST",
        })
    }
}

/// Parsed `Transport` request header
#[derive(Debug, Clone, Default)]
pub struct TransportHeader {
    pub is_tcp: bool,
    pub is_multicast: bool,
    /// `interleaved=a-b`
    pub interleaved: Option<(u8, u8)>,
    /// `client_port=r-c`
    pub client_port: Option<(u16, u16)>,
}

impl TransportHeader {
    pub fn parse(value: &str) -> Self {
        let mut header = TransportHeader {
            is_tcp: value.contains("TCP"),
            is_multicast: value.contains("multicast"),
            ..Default::default()
        };
        for field in value.split(';') {
            let field = field.trim();
            if let Some(ports) = field.strip_prefix("interleaved=") {
                header.interleaved = parse_pair(ports);
            } else if let Some(ports) = field.strip_prefix("client_port=") {
                header.client_port = parse_pair(ports);
            }
        }
        header
    }

    /// The transport mode this header asks for
    pub fn rtp_transport(&self) -> RtpTransport {
        if self.is_tcp {
            RtpTransport::Tcp
        } else if self.is_multicast {
            RtpTransport::Multicast
        } else {
            RtpTransport::Udp
        }
    }
}

fn parse_pair<T: std::str::FromStr + Copy>(value: &str) -> Option<(T, T)> {
    let (a, b) = value.split_once('-')?;
    match (a.trim().parse(), b.trim().parse()) {
        (Ok(a), Ok(b)) => Some((a, b)),
        _ => None,
    }
}

/// Bind an RTP/RTCP socket pair on consecutive ports, RTP even.
///
/// The OS picks a port; odd picks are discarded and retried. The pair is
/// what `server_port`/multicast `port` advertises.
pub async fn make_udp_pair(local_ip: IpAddr) -> io::Result<(UdpSocket, UdpSocket)> {
    let mut last_err = None;
    for _ in 0..16 {
        let rtp = match UdpSocket::bind((local_ip, 0)).await {
            Ok(sock) => sock,
            Err(err) => {
                last_err = Some(err);
                continue;
            }
        };
        let port = rtp.local_addr()?.port();
        if port % 2 != 0 || port == u16::MAX - 1 {
            continue;
        }
        match UdpSocket::bind((local_ip, port + 1)).await {
            Ok(rtcp) => return Ok((rtp, rtcp)),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "no free udp port pair")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tcp_interleaved() {
        let header = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=0-1");
        assert_eq!(header.rtp_transport(), RtpTransport::Tcp);
        assert_eq!(header.interleaved, Some((0, 1)));
    }

    #[test]
    fn parse_udp_client_ports() {
        let header = TransportHeader::parse("RTP/AVP;unicast;client_port=5000-5001");
        assert_eq!(header.rtp_transport(), RtpTransport::Udp);
        assert_eq!(header.client_port, Some((5000, 5001)));
        assert!(header.interleaved.is_none());
    }

    #[test]
    fn parse_multicast() {
        let header = TransportHeader::parse("RTP/AVP;multicast;ttl=64");
        assert_eq!(header.rtp_transport(), RtpTransport::Multicast);
    }

    #[test]
    fn malformed_pairs_ignored() {
        let header = TransportHeader::parse("RTP/AVP;unicast;client_port=oops");
        assert!(header.client_port.is_none());
    }

    #[tokio::test]
    async fn udp_pair_is_consecutive_even_odd() {
        let (rtp, rtcp) = make_udp_pair("127.0.0.1".parse().unwrap()).await.unwrap();
        let rtp_port = rtp.local_addr().unwrap().port();
        let rtcp_port = rtcp.local_addr().unwrap().port();
        assert_eq!(rtp_port % 2, 0);
        assert_eq!(rtcp_port, rtp_port + 1);
    }
}
