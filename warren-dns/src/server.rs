//! Local DNS serve loops
//!
//! Serves recursive queries on a pre-bound UDP socket and TCP listener
//! (same port; stub resolvers use either), answering through a shared
//! response cache backed by the health-aware resolver. The caller owns
//! the sockets and the resolver lifecycle; this type only pumps queries.

use std::sync::{Arc, Mutex};

use hickory_proto::op::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::cache::ResponseCache;
use crate::error::{Error, Result};
use crate::health::HealthAwareResolver;

/// Maximum DNS message size for UDP
const MAX_DNS_MESSAGE_SIZE: usize = 4096;

/// Maximum DNS message size over TCP (16-bit length prefix)
const MAX_TCP_MESSAGE_SIZE: usize = 65535;

/// A running pair of UDP and TCP DNS listeners
pub struct DnsServer {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DnsServer {
    /// Start serving on the given sockets
    pub fn start(
        resolver: Arc<HealthAwareResolver>,
        cache_bytes: usize,
        udp: UdpSocket,
        tcp: TcpListener,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let cache = Arc::new(Mutex::new(ResponseCache::new(cache_bytes)));

        let udp_task = tokio::spawn(run_udp(
            udp,
            resolver.clone(),
            cache.clone(),
            shutdown_tx.subscribe(),
        ));
        let tcp_task = tokio::spawn(run_tcp(tcp, resolver, cache, shutdown_tx.subscribe()));

        Self {
            shutdown_tx,
            tasks: Mutex::new(vec![udp_task, tcp_task]),
        }
    }

    /// Stop both listeners and wait for them
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
    }
}

async fn run_udp(
    socket: UdpSocket,
    resolver: Arc<HealthAwareResolver>,
    cache: Arc<Mutex<ResponseCache>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; MAX_DNS_MESSAGE_SIZE];

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                log::debug!("dns udp listener shutting down");
                return;
            }
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src)) => {
                        let query = buf[..len].to_vec();
                        let socket = socket.clone();
                        let resolver = resolver.clone();
                        let cache = cache.clone();
                        tokio::spawn(async move {
                            match answer(&resolver, &cache, &query).await {
                                Ok(response) => {
                                    if let Err(e) = socket.send_to(&response, src).await {
                                        log::debug!("dns reply to {src} failed: {e}");
                                    }
                                }
                                Err(e) => log::debug!("dns query from {src} failed: {e}"),
                            }
                        });
                    }
                    Err(e) => log::error!("dns udp recv error: {e}"),
                }
            }
        }
    }
}

async fn run_tcp(
    listener: TcpListener,
    resolver: Arc<HealthAwareResolver>,
    cache: Arc<Mutex<ResponseCache>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                log::debug!("dns tcp listener shutting down");
                return;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, src)) => {
                        let resolver = resolver.clone();
                        let cache = cache.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_tcp_conn(stream, &resolver, &cache).await {
                                log::debug!("dns tcp connection from {src} ended: {e}");
                            }
                        });
                    }
                    Err(e) => log::error!("dns tcp accept error: {e}"),
                }
            }
        }
    }
}

/// Serve length-prefixed DNS messages on one TCP connection until EOF
async fn serve_tcp_conn(
    mut stream: TcpStream,
    resolver: &HealthAwareResolver,
    cache: &Mutex<ResponseCache>,
) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_TCP_MESSAGE_SIZE {
            return Err(Error::Message(format!("bad tcp message length {len}")));
        }

        let mut query = vec![0u8; len];
        stream.read_exact(&mut query).await?;

        let response = answer(resolver, cache, &query).await?;
        let reply_len = (response.len().min(MAX_TCP_MESSAGE_SIZE) as u16).to_be_bytes();
        stream.write_all(&reply_len).await?;
        stream.write_all(&response).await?;
    }
}

/// Answer one raw query: cache lookup, upstream exchange, cache fill
async fn answer(
    resolver: &HealthAwareResolver,
    cache: &Mutex<ResponseCache>,
    query_bytes: &[u8],
) -> Result<Vec<u8>> {
    // Header alone is 12 bytes.
    if query_bytes.len() < 12 {
        return Err(Error::Message("query too short".into()));
    }

    let message =
        Message::from_vec(query_bytes).map_err(|e| Error::Message(format!("invalid query: {e}")))?;
    let query = message
        .queries()
        .first()
        .ok_or_else(|| Error::Message("query has no questions".into()))?;

    {
        let mut cache = cache.lock().unwrap();
        if let Some(mut response) = cache.get(query) {
            if response.len() >= 2 {
                response[0] = query_bytes[0];
                response[1] = query_bytes[1];
            }
            log::debug!("dns cache hit for {}", query.name());
            return Ok(response);
        }
    }

    let response = resolver.exchange(query_bytes).await?;

    cache.lock().unwrap().insert(query, &response);
    Ok(response)
}
