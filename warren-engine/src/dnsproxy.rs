//! Local caching DNS proxy lifecycle
//!
//! Composes the dns crate's pieces into the engine-facing proxy: parse
//! the configured upstreams, wrap them with the health-aware resolver,
//! allocate a port free on both TCP and UDP, and serve. Failure to start
//! is non-fatal to the engine: tunnels then resolve directly against
//! the configured upstreams.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use warren_dns::{DnsServer, HealthAwareResolver, Upstream, UpstreamHealth, DEFAULT_CAPACITY_BYTES};

use crate::error::{Error, Result};
use crate::port;

/// A running local DNS proxy
pub struct DnsProxy {
    addr: SocketAddr,
    server: DnsServer,
    resolver: Arc<HealthAwareResolver>,
}

impl DnsProxy {
    /// Build upstreams and start serving on a freshly allocated dual port
    pub async fn start(upstream_addrs: &[String]) -> Result<Self> {
        if upstream_addrs.is_empty() {
            return Err(Error::Config("no resolvers configured".into()));
        }

        let mut upstreams = Vec::with_capacity(upstream_addrs.len());
        for addr in upstream_addrs {
            upstreams.push(Upstream::parse(addr)?);
        }

        let resolver = Arc::new(HealthAwareResolver::new(upstreams));

        let listen_port = match port::any_dual() {
            Ok(p) => p,
            Err(e) => {
                resolver.close().await;
                return Err(e);
            }
        };
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, listen_port));

        let (udp, tcp) = match bind_pair(addr).await {
            Ok(pair) => pair,
            Err(e) => {
                resolver.close().await;
                return Err(e.into());
            }
        };

        let server = DnsServer::start(resolver.clone(), DEFAULT_CAPACITY_BYTES, udp, tcp);
        log::info!("dns proxy listening on {addr}");

        Ok(Self {
            addr,
            server,
            resolver,
        })
    }

    /// Listener address, `127.0.0.1:<port>`
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Health snapshot of every upstream
    pub fn upstream_status(&self) -> Vec<UpstreamHealth> {
        self.resolver.status()
    }

    /// Shut down the listeners, then the health monitor
    pub async fn stop(&self) {
        self.server.shutdown().await;
        self.resolver.close().await;
    }
}

async fn bind_pair(
    addr: SocketAddr,
) -> std::io::Result<(tokio::net::UdpSocket, tokio::net::TcpListener)> {
    let udp = tokio::net::UdpSocket::bind(addr).await?;
    let tcp = tokio::net::TcpListener::bind(addr).await?;
    Ok((udp, tcp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket;

    #[tokio::test]
    async fn test_start_serves_and_stops() {
        // Fake upstream answering everything.
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            while let Ok((len, src)) = upstream.recv_from(&mut buf).await {
                buf[2] |= 0x80;
                let _ = upstream.send_to(&buf[..len], src).await;
            }
        });

        let proxy = DnsProxy::start(&[upstream_addr.to_string()]).await.unwrap();
        assert_eq!(proxy.addr().ip(), std::net::IpAddr::from(Ipv4Addr::LOCALHOST));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(proxy.addr()).await.unwrap();
        client.send(&warren_dns::probe_query().unwrap()).await.unwrap();
        let mut buf = vec![0u8; 512];
        let len = tokio::time::timeout(std::time::Duration::from_secs(5), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(len >= 12);

        assert_eq!(proxy.upstream_status().len(), 1);
        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_empty_upstreams_rejected() {
        assert!(DnsProxy::start(&[]).await.is_err());
    }

    #[tokio::test]
    async fn test_bad_upstream_address_rejected() {
        assert!(DnsProxy::start(&["not an address".to_string()]).await.is_err());
    }
}
