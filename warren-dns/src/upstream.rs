//! A single upstream recursive DNS server
//!
//! Upstreams speak classic DNS over UDP. Each exchange uses a fresh
//! connected socket so stray datagrams from other servers are rejected
//! by the kernel.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use tokio::net::UdpSocket;

use crate::error::{Error, Result};

/// Timeout for a regular upstream exchange
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum UDP DNS response size
const MAX_UDP_RESPONSE_SIZE: usize = 4096;

/// A recursive DNS server reachable over UDP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    addr: SocketAddr,
}

impl Upstream {
    /// Create an upstream from a socket address
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Parse an upstream from `host:port` or a bare IP (port 53 assumed)
    pub fn parse(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self { addr });
        }
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(Self {
                addr: SocketAddr::new(ip, 53),
            });
        }
        Err(Error::Config(format!("invalid resolver address: {s:?}")))
    }

    /// The upstream's socket address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Send a raw DNS query and return the raw response
    pub async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>> {
        let bind_addr = if self.addr.is_ipv6() {
            SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, 0))
        };

        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(self.addr).await.map_err(|e| Error::Upstream {
            addr: self.addr,
            reason: e.to_string(),
        })?;

        socket.send(query).await.map_err(|e| Error::Upstream {
            addr: self.addr,
            reason: format!("send: {e}"),
        })?;

        let mut buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
        match tokio::time::timeout(EXCHANGE_TIMEOUT, socket.recv(&mut buf)).await {
            Ok(Ok(len)) => {
                buf.truncate(len);
                Ok(buf)
            }
            Ok(Err(e)) => Err(Error::Upstream {
                addr: self.addr,
                reason: format!("recv: {e}"),
            }),
            Err(_) => Err(Error::Timeout(self.addr)),
        }
    }
}

impl std::fmt::Display for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.addr.fmt(f)
    }
}

/// Build the synthetic probe query: NS for the root zone
pub fn probe_query() -> Result<Vec<u8>> {
    let mut msg = Message::new();
    // Derive the id from the clock; probes never overlap per upstream.
    let id = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u16)
        .unwrap_or(0);
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(Name::root(), RecordType::NS));
    msg.to_vec().map_err(|e| Error::Message(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        let u = Upstream::parse("9.9.9.9:5353").unwrap();
        assert_eq!(u.addr(), "9.9.9.9:5353".parse().unwrap());
    }

    #[test]
    fn test_parse_bare_ip_defaults_to_53() {
        let u = Upstream::parse("1.1.1.1").unwrap();
        assert_eq!(u.addr(), "1.1.1.1:53".parse().unwrap());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Upstream::parse("not-an-address").is_err());
        assert!(Upstream::parse("").is_err());
    }

    #[test]
    fn test_probe_query_is_root_ns() {
        let bytes = probe_query().unwrap();
        let msg = Message::from_vec(&bytes).unwrap();
        assert_eq!(msg.queries().len(), 1);
        assert_eq!(msg.queries()[0].query_type(), RecordType::NS);
        assert!(msg.queries()[0].name().is_root());
    }

    #[tokio::test]
    async fn test_exchange_roundtrip() {
        // Minimal fake DNS server: echo the query with the QR bit set.
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (len, src) = server.recv_from(&mut buf).await.unwrap();
            buf[2] |= 0x80;
            server.send_to(&buf[..len], src).await.unwrap();
        });

        let upstream = Upstream::new(server_addr);
        let query = probe_query().unwrap();
        let response = upstream.exchange(&query).await.unwrap();
        assert_eq!(response[0..2], query[0..2]);
        assert_ne!(response[2] & 0x80, 0);
    }

    #[tokio::test]
    async fn test_exchange_refused_port_fails() {
        // Nothing listens here; the connected socket surfaces the ICMP error.
        let dead = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = dead.local_addr().unwrap();
        drop(dead);

        let upstream = Upstream::new(addr);
        let query = probe_query().unwrap();
        assert!(upstream.exchange(&query).await.is_err());
    }
}
