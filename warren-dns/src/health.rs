//! Health-aware upstream failover
//!
//! Wraps a pool of upstream servers, routing each query to the fastest
//! healthy one with sequential fallback to the others on failure. Queries
//! are never fanned out in parallel: a DNS tunnel endpoint sees every
//! datagram we send it, so duplicate queries amplify tunnel load.
//!
//! A background monitor probes the pool with root-NS queries, tracking an
//! exponential moving average of latency and a consecutive failure count
//! per upstream.

use std::cmp::Ordering;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::upstream::{probe_query, Upstream};

/// How often healthy upstreams are probed
pub const PROBE_INTERVAL_HEALTHY: Duration = Duration::from_secs(10);

/// How often unhealthy upstreams are re-probed
pub const PROBE_INTERVAL_UNHEALTHY: Duration = Duration::from_secs(30);

/// Hard deadline for a single probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Consecutive failures before an upstream is marked unhealthy
pub const FAILURE_THRESHOLD: u32 = 3;

/// Smoothing factor for the latency moving average
pub const LATENCY_ALPHA: f64 = 0.3;

/// Mutable health state of one upstream
#[derive(Debug, Clone)]
struct UpstreamState {
    healthy: bool,
    /// Zero means "never measured"
    avg_latency: Duration,
    failures: u32,
    last_check: Option<Instant>,
}

impl UpstreamState {
    fn new() -> Self {
        Self {
            healthy: true,
            avg_latency: Duration::ZERO,
            failures: 0,
            last_check: None,
        }
    }
}

/// Read-only snapshot of an upstream's health
#[derive(Debug, Clone)]
pub struct UpstreamHealth {
    pub addr: SocketAddr,
    pub healthy: bool,
    pub avg_latency: Duration,
    pub failures: u32,
}

struct Entry {
    upstream: Upstream,
    state: Mutex<UpstreamState>,
}

/// Routes queries to the fastest healthy upstream with sequential fallback
pub struct HealthAwareResolver {
    entries: Arc<Vec<Arc<Entry>>>,
    shutdown_tx: broadcast::Sender<()>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl HealthAwareResolver {
    /// Create the resolver and start its health monitor
    pub fn new(upstreams: Vec<Upstream>) -> Self {
        let entries: Arc<Vec<Arc<Entry>>> = Arc::new(
            upstreams
                .into_iter()
                .map(|upstream| {
                    Arc::new(Entry {
                        upstream,
                        state: Mutex::new(UpstreamState::new()),
                    })
                })
                .collect(),
        );

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let monitor = tokio::spawn(monitor_loop(entries.clone(), shutdown_rx));

        Self {
            entries,
            shutdown_tx,
            monitor: Mutex::new(Some(monitor)),
        }
    }

    /// Send a raw DNS query to the pool
    ///
    /// Healthy upstreams are tried one at a time, fastest first; when all
    /// are unhealthy every upstream is tried in registration order. The
    /// first successful response wins; otherwise the last error is
    /// returned.
    pub async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>> {
        let mut order = self.healthy_order();
        if order.is_empty() {
            order = (0..self.entries.len()).collect();
        }
        if order.is_empty() {
            return Err(Error::NoUpstreams);
        }

        let mut last_err = None;
        for idx in order {
            let entry = &self.entries[idx];
            match entry.upstream.exchange(query).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    log::debug!("upstream {} query failed: {}", entry.upstream, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(Error::NoUpstreams))
    }

    /// Snapshot the health of every upstream, in registration order
    pub fn status(&self) -> Vec<UpstreamHealth> {
        self.entries
            .iter()
            .map(|entry| {
                let state = entry.state.lock().unwrap();
                UpstreamHealth {
                    addr: entry.upstream.addr(),
                    healthy: state.healthy,
                    avg_latency: state.avg_latency,
                    failures: state.failures,
                }
            })
            .collect()
    }

    /// Stop the health monitor and wait for it to finish
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(());
        let handle = self.monitor.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Indices of healthy upstreams, fastest first
    fn healthy_order(&self) -> Vec<usize> {
        let snapshots: Vec<(bool, Duration)> = self
            .entries
            .iter()
            .map(|entry| {
                let state = entry.state.lock().unwrap();
                (state.healthy, state.avg_latency)
            })
            .collect();
        order_by_latency(&snapshots)
    }

    #[cfg(test)]
    fn set_state(&self, idx: usize, healthy: bool, avg_latency: Duration, failures: u32) {
        let mut state = self.entries[idx].state.lock().unwrap();
        state.healthy = healthy;
        state.avg_latency = avg_latency;
        state.failures = failures;
    }
}

/// Order healthy upstreams by measured latency.
///
/// Unmeasured (zero) latencies sort after measured ones: at startup this
/// preserves registration order, and later it avoids preferring an
/// upstream we know nothing about over one with a proven low latency.
/// The sort is stable, so equal entries keep registration order.
fn order_by_latency(snapshots: &[(bool, Duration)]) -> Vec<usize> {
    let mut indices: Vec<usize> = snapshots
        .iter()
        .enumerate()
        .filter(|(_, (healthy, _))| *healthy)
        .map(|(i, _)| i)
        .collect();

    indices.sort_by(|&a, &b| {
        let la = snapshots[a].1;
        let lb = snapshots[b].1;
        match (la.is_zero(), lb.is_zero()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => la.cmp(&lb),
        }
    });

    indices
}

/// Fold one probe outcome into an upstream's state
fn apply_probe(state: &mut UpstreamState, latency: Duration, failed: bool) {
    state.last_check = Some(Instant::now());

    if failed {
        state.failures += 1;
        if state.failures >= FAILURE_THRESHOLD {
            state.healthy = false;
        }
        return;
    }

    if state.avg_latency.is_zero() {
        state.avg_latency = latency;
    } else {
        let blended = state.avg_latency.as_secs_f64() * (1.0 - LATENCY_ALPHA)
            + latency.as_secs_f64() * LATENCY_ALPHA;
        state.avg_latency = Duration::from_secs_f64(blended);
    }
    state.failures = 0;
    state.healthy = true;
}

async fn monitor_loop(entries: Arc<Vec<Arc<Entry>>>, mut shutdown_rx: broadcast::Receiver<()>) {
    let start = tokio::time::Instant::now();
    let mut healthy_tick =
        tokio::time::interval_at(start + PROBE_INTERVAL_HEALTHY, PROBE_INTERVAL_HEALTHY);
    let mut unhealthy_tick =
        tokio::time::interval_at(start + PROBE_INTERVAL_UNHEALTHY, PROBE_INTERVAL_UNHEALTHY);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return,
            _ = healthy_tick.tick() => probe_round(&entries, true),
            _ = unhealthy_tick.tick() => probe_round(&entries, false),
        }
    }
}

/// Probe every upstream matching the requested health state, in parallel.
/// Each probe serializes its own state update; probes for different
/// upstreams never contend.
fn probe_round(entries: &Arc<Vec<Arc<Entry>>>, healthy_only: bool) {
    for entry in entries.iter() {
        let is_healthy = entry.state.lock().unwrap().healthy;
        if is_healthy != healthy_only {
            continue;
        }
        let entry = entry.clone();
        tokio::spawn(async move {
            probe_one(&entry).await;
        });
    }
}

async fn probe_one(entry: &Entry) {
    let query = match probe_query() {
        Ok(q) => q,
        Err(e) => {
            log::error!("failed to build probe query: {e}");
            return;
        }
    };

    let started = Instant::now();
    let outcome = tokio::time::timeout(PROBE_TIMEOUT, entry.upstream.exchange(&query)).await;
    let latency = started.elapsed();

    let failed = !matches!(outcome, Ok(Ok(_)));
    if failed {
        log::debug!("probe of {} failed", entry.upstream);
    }

    let mut state = entry.state.lock().unwrap();
    apply_probe(&mut state, latency, failed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_order_fastest_first() {
        let order = order_by_latency(&[(true, ms(200)), (true, ms(20)), (true, ms(90))]);
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn test_order_unmeasured_sorts_last() {
        let order = order_by_latency(&[(true, Duration::ZERO), (true, ms(150))]);
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn test_order_all_unmeasured_keeps_registration_order() {
        let order = order_by_latency(&[
            (true, Duration::ZERO),
            (true, Duration::ZERO),
            (true, Duration::ZERO),
        ]);
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_order_skips_unhealthy() {
        let order = order_by_latency(&[(false, ms(5)), (true, ms(80)), (false, Duration::ZERO)]);
        assert_eq!(order, vec![1]);
    }

    #[test]
    fn test_failure_threshold_marks_unhealthy() {
        let mut state = UpstreamState::new();
        apply_probe(&mut state, ms(10), true);
        apply_probe(&mut state, ms(10), true);
        assert!(state.healthy);
        apply_probe(&mut state, ms(10), true);
        assert!(!state.healthy);
        assert_eq!(state.failures, 3);
    }

    #[test]
    fn test_success_resets_failures_and_recovers() {
        let mut state = UpstreamState::new();
        for _ in 0..4 {
            apply_probe(&mut state, ms(10), true);
        }
        assert!(!state.healthy);

        apply_probe(&mut state, ms(40), false);
        assert!(state.healthy);
        assert_eq!(state.failures, 0);
        assert_eq!(state.avg_latency, ms(40));
    }

    #[test]
    fn test_latency_moving_average() {
        let mut state = UpstreamState::new();
        apply_probe(&mut state, ms(100), false);
        assert_eq!(state.avg_latency, ms(100));

        apply_probe(&mut state, ms(200), false);
        // 100 * 0.7 + 200 * 0.3 = 130
        let avg = state.avg_latency.as_millis();
        assert!((129..=131).contains(&avg), "avg was {avg}ms");
    }

    async fn spawn_responder() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            while let Ok((len, src)) = socket.recv_from(&mut buf).await {
                buf[2] |= 0x80;
                let _ = socket.send_to(&buf[..len], src).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_exchange_falls_back_past_dead_upstream() {
        let dead = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);
        let live_addr = spawn_responder().await;

        let resolver =
            HealthAwareResolver::new(vec![Upstream::new(dead_addr), Upstream::new(live_addr)]);

        // Pin the dead upstream as "fastest" so it is dialed first.
        resolver.set_state(0, true, ms(1), 0);
        resolver.set_state(1, true, ms(50), 0);

        let response = resolver.exchange(&probe_query().unwrap()).await.unwrap();
        assert_ne!(response[2] & 0x80, 0);
        resolver.close().await;
    }

    #[tokio::test]
    async fn test_exchange_prefers_fastest_healthy() {
        // Two live responders; the one marked faster must be the one that
        // answers (each responder stamps a marker byte so we can tell).
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_addr = a.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            while let Ok((len, src)) = a.recv_from(&mut buf).await {
                buf[2] |= 0x80;
                buf[3] = 0xAA;
                let _ = a.send_to(&buf[..len], src).await;
            }
        });
        let b_addr = spawn_responder().await;

        let resolver =
            HealthAwareResolver::new(vec![Upstream::new(b_addr), Upstream::new(a_addr)]);
        resolver.set_state(0, true, ms(200), 0);
        resolver.set_state(1, true, ms(20), 0);

        let response = resolver.exchange(&probe_query().unwrap()).await.unwrap();
        assert_eq!(response[3], 0xAA);
        resolver.close().await;
    }

    #[tokio::test]
    async fn test_all_unhealthy_uses_registration_order_fallback() {
        let live_addr = spawn_responder().await;
        let resolver = HealthAwareResolver::new(vec![Upstream::new(live_addr)]);
        resolver.set_state(0, false, ms(10), 5);

        // Even though every upstream is unhealthy, the emergency path
        // still produces an answer.
        let response = resolver.exchange(&probe_query().unwrap()).await.unwrap();
        assert_ne!(response[2] & 0x80, 0);
        resolver.close().await;
    }

    #[tokio::test]
    async fn test_empty_pool_fails() {
        let resolver = HealthAwareResolver::new(Vec::new());
        let err = resolver.exchange(&probe_query().unwrap()).await.unwrap_err();
        assert!(matches!(err, Error::NoUpstreams));
        resolver.close().await;
    }
}
