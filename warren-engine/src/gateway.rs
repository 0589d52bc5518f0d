//! TCP relay gateway
//!
//! A transport-agnostic relay on a fixed loopback address. Every
//! accepted connection asks the engine for the *current* active tunnel
//! target and pipes bytes both ways; switching the active tunnel only
//! affects connections accepted afterwards. No protocol interpretation
//! happens here; whatever the active tunnel speaks is spoken end to
//! end.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};

use crate::error::{Error, Result};

/// Deadline for dialing the active tunnel's port
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-connection resolution of the active tunnel address.
///
/// A function value rather than an engine reference breaks the
/// ownership cycle between the engine and the gateway; the closure
/// takes the engine read lock briefly per connection.
pub type TargetResolver =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Option<SocketAddr>> + Send>> + Send + Sync>;

/// The running relay listener
pub struct Gateway {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    /// Bind the listener and start relaying
    pub async fn start(addr: SocketAddr, resolver: TargetResolver) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Conflict(format!("gateway: failed to listen on {addr}: {e}")))?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let accept_handle = tokio::spawn(accept_loop(listener, resolver, shutdown_rx));

        log::info!("gateway listening on {local_addr}");

        Ok(Self {
            local_addr,
            shutdown_tx,
            accept_handle: Mutex::new(Some(accept_handle)),
        })
    }

    /// The actual listen address (differs from the requested one after a
    /// port reassignment or a port-zero bind)
    pub fn addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for in-flight relays to drain
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let handle = self.accept_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    resolver: TargetResolver,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut relays = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            result = listener.accept() => {
                match result {
                    Ok((conn, _)) => {
                        let resolver = resolver.clone();
                        relays.spawn(async move {
                            relay(conn, resolver).await;
                        });
                    }
                    Err(e) => log::warn!("gateway accept error: {e}"),
                }
            }
        }
    }

    drop(listener);
    while relays.join_next().await.is_some() {}
    log::debug!("gateway drained");
}

async fn relay(mut conn: TcpStream, resolver: TargetResolver) {
    let Some(target) = resolver().await else {
        // No live active tunnel; close immediately.
        return;
    };

    let mut upstream = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            log::debug!("gateway dial {target} failed: {e}");
            return;
        }
        Err(_) => {
            log::debug!("gateway dial {target} timed out");
            return;
        }
    };

    let _ = tokio::io::copy_bidirectional(&mut conn, &mut upstream).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Echo server that prefixes every reply with a marker byte
    async fn spawn_marked_echo(marker: u8) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 256];
                    loop {
                        match conn.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                let mut reply = vec![marker];
                                reply.extend_from_slice(&buf[..n]);
                                if conn.write_all(&reply).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    fn fixed_resolver(slot: Arc<std::sync::Mutex<Option<SocketAddr>>>) -> TargetResolver {
        Arc::new(move || {
            let slot = slot.clone();
            Box::pin(async move { *slot.lock().unwrap() })
        })
    }

    async fn roundtrip(addr: SocketAddr, payload: &[u8]) -> Option<Vec<u8>> {
        let mut conn = TcpStream::connect(addr).await.ok()?;
        conn.write_all(payload).await.ok()?;
        let mut buf = vec![0u8; payload.len() + 1];
        tokio::time::timeout(Duration::from_secs(2), conn.read_exact(&mut buf))
            .await
            .ok()?
            .ok()?;
        Some(buf)
    }

    #[tokio::test]
    async fn test_relays_to_active_target() {
        let echo = spawn_marked_echo(b'A').await;
        let slot = Arc::new(std::sync::Mutex::new(Some(echo)));
        let gw = Gateway::start("127.0.0.1:0".parse().unwrap(), fixed_resolver(slot))
            .await
            .unwrap();

        let reply = roundtrip(gw.addr(), b"ping").await.unwrap();
        assert_eq!(reply, b"Aping");
        gw.stop().await;
    }

    #[tokio::test]
    async fn test_switch_affects_only_new_connections() {
        let echo_a = spawn_marked_echo(b'A').await;
        let echo_b = spawn_marked_echo(b'B').await;
        let slot = Arc::new(std::sync::Mutex::new(Some(echo_a)));
        let gw = Gateway::start("127.0.0.1:0".parse().unwrap(), fixed_resolver(slot.clone()))
            .await
            .unwrap();

        // Open a connection while A is active and keep it alive.
        let mut held = TcpStream::connect(gw.addr()).await.unwrap();
        held.write_all(b"one").await.unwrap();
        let mut buf = [0u8; 4];
        held.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"Aone");

        // Switch; the held connection must stay on A.
        *slot.lock().unwrap() = Some(echo_b);
        let reply = roundtrip(gw.addr(), b"two").await.unwrap();
        assert_eq!(reply, b"Btwo");

        held.write_all(b"still").await.unwrap();
        let mut buf = [0u8; 6];
        held.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"Astill");

        // Close our end so the in-flight relay can drain.
        drop(held);
        gw.stop().await;
    }

    #[tokio::test]
    async fn test_no_target_closes_immediately() {
        let slot = Arc::new(std::sync::Mutex::new(None));
        let gw = Gateway::start("127.0.0.1:0".parse().unwrap(), fixed_resolver(slot))
            .await
            .unwrap();

        let mut conn = TcpStream::connect(gw.addr()).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), conn.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        gw.stop().await;
    }

    #[tokio::test]
    async fn test_addr_reports_bound_port() {
        let slot = Arc::new(std::sync::Mutex::new(None));
        let gw = Gateway::start("127.0.0.1:0".parse().unwrap(), fixed_resolver(slot))
            .await
            .unwrap();
        assert_ne!(gw.addr().port(), 0);
        gw.stop().await;
    }
}
