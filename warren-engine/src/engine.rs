//! The warren engine
//!
//! Owns the configuration, the DNS proxy, the gateway, the process
//! manager, and every running tunnel. All public methods take the one
//! engine lock; anything unbounded (the SSH bootstrap wait) happens in a
//! detached task that only reacquires the lock briefly.

use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::binaries::{BinaryResolver, DirResolver};
use crate::config::{BackendKind, EngineConfig, Paths, TransportKind, TunnelSpec};
use crate::dnsproxy::DnsProxy;
use crate::error::{Error, Result};
use crate::gateway::{Gateway, TargetResolver};
use crate::port;
use crate::process::ProcessManager;
use crate::sshtunnel::{SshTunnel, SshTunnelConfig};
use crate::transport;

/// How long an SSH tunnel waits for its transport child to accept
const TRANSPORT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll cadence while waiting for the transport port
const READY_POLL: Duration = Duration::from_millis(200);

/// Per-poll dial deadline
const READY_DIAL_TIMEOUT: Duration = Duration::from_millis(500);

/// Snapshot of the engine and all tunnels
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Status {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub active: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gateway_addr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dns_proxy_addr: String,
    #[serde(default)]
    pub tunnels: BTreeMap<String, TunnelStatus>,
}

/// Snapshot of one tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelStatus {
    pub tag: String,
    pub transport: TransportKind,
    pub backend: BackendKind,
    pub domain: String,
    pub running: bool,
    pub active: bool,
    pub port: u16,
}

/// In-memory state of one started tunnel
struct RunningTunnel {
    spec: TunnelSpec,
    process_name: String,
    /// Port the transport child listens on (internal when SSH is chained)
    #[allow(dead_code)]
    transport_port: u16,
    /// Port the gateway may forward to
    exposed_port: u16,
    /// Present iff backend = ssh, installed by the bootstrap task
    ssh: Option<Arc<SshTunnel>>,
}

struct EngineState {
    cfg: EngineConfig,
    tunnels: HashMap<String, RunningTunnel>,
    gateway: Option<Gateway>,
    dns_proxy: Option<DnsProxy>,
}

struct Inner {
    paths: Paths,
    procs: Arc<ProcessManager>,
    binaries: Arc<dyn BinaryResolver>,
    state: RwLock<EngineState>,
}

/// The engine handle; cheap to clone
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Create an engine over the given config and directories
    pub fn new(cfg: EngineConfig, paths: Paths) -> Self {
        let procs = ProcessManager::new(paths.state_path());
        let binaries: Arc<dyn BinaryResolver> = Arc::new(DirResolver::new(paths.bin_dir()));

        let engine = Self {
            inner: Arc::new(Inner {
                paths,
                procs: procs.clone(),
                binaries,
                state: RwLock::new(EngineState {
                    cfg,
                    tunnels: HashMap::new(),
                    gateway: None,
                    dns_proxy: None,
                }),
            }),
        };

        // Drain child-exit notifications without ever blocking a reaper:
        // the reaper only signals; this task takes the engine lock.
        if let Some(mut exits) = procs.take_exit_events() {
            let weak = Arc::downgrade(&engine.inner);
            tokio::spawn(async move {
                while let Some(name) = exits.recv().await {
                    let Some(inner) = weak.upgrade() else { return };
                    Engine { inner }.purge_exited(&name).await;
                }
            });
        }

        engine
    }

    /// Start the DNS proxy, the gateway, and every enabled tunnel.
    ///
    /// DNS proxy failure degrades to direct resolvers; a tunnel failure
    /// degrades to a warning so the rest still come up; gateway failure
    /// is fatal.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.inner.state.write().await;

        if let Err(e) = self.start_dns_proxy_locked(&mut state).await {
            log::warn!("dns proxy failed to start: {e} (using direct resolvers)");
        }

        self.start_gateway_locked(&mut state).await?;

        let tags: Vec<String> = state
            .cfg
            .tunnels
            .iter()
            .filter(|t| t.is_enabled())
            .map(|t| t.tag.clone())
            .collect();
        for tag in tags {
            if let Err(e) = self.start_tunnel_locked(&mut state, &tag).await {
                log::warn!("failed to start tunnel {tag:?}: {e}");
            }
        }

        Ok(())
    }

    /// Stop everything: SSH adapters, children, gateway, DNS proxy last
    /// (children may still be resolving while they shut down).
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.inner.state.write().await;

        let adapters: Vec<Arc<SshTunnel>> =
            state.tunnels.values().filter_map(|rt| rt.ssh.clone()).collect();
        for ssh in adapters {
            let _ = tokio::task::spawn_blocking(move || ssh.stop()).await;
        }
        state.tunnels.clear();

        let _ = self.inner.procs.stop_all().await;

        if let Some(gw) = state.gateway.take() {
            gw.stop().await;
        }
        if let Some(proxy) = state.dns_proxy.take() {
            proxy.stop().await;
        }

        Ok(())
    }

    /// Start one tunnel by tag
    pub async fn start_tunnel(&self, tag: &str) -> Result<()> {
        let mut state = self.inner.state.write().await;

        if state.dns_proxy.is_none() {
            if let Err(e) = self.start_dns_proxy_locked(&mut state).await {
                log::warn!("dns proxy failed to start: {e} (using direct resolvers)");
            }
        }

        self.start_tunnel_locked(&mut state, tag).await?;

        if let Err(e) = self.start_gateway_locked(&mut state).await {
            log::error!("tunnel {tag:?} started but gateway failed: {e}");
            return Err(e);
        }
        Ok(())
    }

    /// Stop one tunnel by tag; stops the gateway when nothing is left
    pub async fn stop_tunnel(&self, tag: &str) -> Result<()> {
        let mut state = self.inner.state.write().await;

        // SSH adapter first; it depends on the transport child.
        let ssh = state.tunnels.get(tag).and_then(|rt| rt.ssh.clone());
        if let Some(ssh) = ssh {
            let _ = tokio::task::spawn_blocking(move || ssh.stop()).await;
        }
        state.tunnels.remove(tag);

        let process_name = process_name(tag);
        self.inner.procs.stop(&process_name).await?;

        if !self.has_running_tunnels(&state) {
            if let Some(gw) = state.gateway.take() {
                gw.stop().await;
            }
        }
        Ok(())
    }

    /// Stop then start
    pub async fn restart_tunnel(&self, tag: &str) -> Result<()> {
        let mut state = self.inner.state.write().await;

        let ssh = state.tunnels.get(tag).and_then(|rt| rt.ssh.clone());
        if let Some(ssh) = ssh {
            let _ = tokio::task::spawn_blocking(move || ssh.stop()).await;
        }
        state.tunnels.remove(tag);
        let _ = self.inner.procs.stop(&process_name(tag)).await;

        self.start_tunnel_locked(&mut state, tag).await
    }

    /// Point the gateway at a tunnel and persist the choice. Takes
    /// effect on the next accepted connection; nothing is started or
    /// stopped.
    pub async fn activate_tunnel(&self, tag: &str) -> Result<()> {
        let mut state = self.inner.state.write().await;

        if state.cfg.tunnel(tag).is_none() {
            return Err(Error::NotFound(format!("tunnel {tag:?} not found")));
        }

        state.cfg.route.active = tag.to_string();
        state.cfg.save(&self.inner.paths.config_path())
    }

    /// Snapshot of the engine and all configured tunnels
    pub async fn status(&self) -> Status {
        struct Row {
            status: TunnelStatus,
            ssh: Option<Arc<SshTunnel>>,
            ssh_required: bool,
        }

        let (mut out, rows) = {
            let state = self.inner.state.read().await;

            let out = Status {
                active: state.cfg.route.active.clone(),
                gateway_addr: state
                    .gateway
                    .as_ref()
                    .map(|g| g.addr().to_string())
                    .unwrap_or_default(),
                dns_proxy_addr: state
                    .dns_proxy
                    .as_ref()
                    .map(|p| p.addr().to_string())
                    .unwrap_or_default(),
                tunnels: BTreeMap::new(),
            };

            let rows: Vec<Row> = state
                .cfg
                .tunnels
                .iter()
                .map(|spec| {
                    let running = self.inner.procs.is_running(&process_name(&spec.tag));
                    let entry = state.tunnels.get(&spec.tag);
                    Row {
                        status: TunnelStatus {
                            tag: spec.tag.clone(),
                            transport: spec.transport,
                            backend: spec.backend,
                            domain: spec.domain.clone(),
                            running,
                            active: spec.tag == state.cfg.route.active,
                            port: entry.map(|rt| rt.exposed_port).unwrap_or(spec.port),
                        },
                        ssh: entry.and_then(|rt| rt.ssh.clone()),
                        ssh_required: spec.backend == BackendKind::Ssh,
                    }
                })
                .collect();

            (out, rows)
        };

        for row in rows {
            let mut status = row.status;
            if row.ssh_required && status.running {
                status.running = match row.ssh {
                    Some(ssh) => tokio::task::spawn_blocking(move || ssh.is_alive())
                        .await
                        .unwrap_or(false),
                    None => false,
                };
            }
            out.tunnels.insert(status.tag.clone(), status);
        }

        out
    }

    /// Current in-memory configuration
    pub async fn get_config(&self) -> EngineConfig {
        self.inner.state.read().await.cfg.clone()
    }

    /// Re-read the configuration from disk
    pub async fn reload_config(&self) -> Result<()> {
        let cfg = EngineConfig::load(&self.inner.paths.config_path())?;
        self.inner.state.write().await.cfg = cfg;
        Ok(())
    }

    /// Whether any tunnel is running
    pub async fn is_connected(&self) -> bool {
        let state = self.inner.state.read().await;
        self.has_running_tunnels(&state)
    }

    /// Resolve the gateway's current forward target. Empty unless the
    /// active tunnel's child is alive and, for SSH backends, its adapter
    /// answers a keepalive.
    pub async fn active_target(&self) -> Option<SocketAddr> {
        let (exposed_port, ssh) = {
            let state = self.inner.state.read().await;
            let tag = state.cfg.route.active.clone();
            if tag.is_empty() {
                return None;
            }
            let rt = state.tunnels.get(&tag)?;
            if !self.inner.procs.is_running(&rt.process_name) {
                return None;
            }
            let ssh = if rt.spec.backend == BackendKind::Ssh {
                match &rt.ssh {
                    Some(ssh) => Some(ssh.clone()),
                    None => return None,
                }
            } else {
                None
            };
            (rt.exposed_port, ssh)
        };

        if let Some(ssh) = ssh {
            let alive = tokio::task::spawn_blocking(move || ssh.is_alive())
                .await
                .unwrap_or(false);
            if !alive {
                return None;
            }
        }

        Some(SocketAddr::from((Ipv4Addr::LOCALHOST, exposed_port)))
    }

    fn has_running_tunnels(&self, state: &EngineState) -> bool {
        state
            .tunnels
            .values()
            .any(|rt| self.inner.procs.is_running(&rt.process_name) || rt.ssh.is_some())
    }

    async fn start_dns_proxy_locked(&self, state: &mut EngineState) -> Result<()> {
        if state.dns_proxy.is_some() || state.cfg.resolvers.is_empty() {
            return Ok(());
        }
        let proxy = DnsProxy::start(&state.cfg.resolvers).await?;
        state.dns_proxy = Some(proxy);
        Ok(())
    }

    async fn start_gateway_locked(&self, state: &mut EngineState) -> Result<()> {
        if state.gateway.is_some() {
            return Ok(());
        }

        let addr_str = if state.cfg.listen.socks.is_empty() {
            crate::config::DEFAULT_SOCKS_LISTEN.to_string()
        } else {
            state.cfg.listen.socks.clone()
        };
        let mut addr: SocketAddr = addr_str
            .parse()
            .map_err(|_| Error::Config(format!("invalid listen.socks address: {addr_str:?}")))?;

        // If the configured port is taken, reallocate and persist the new
        // address before reporting success, so status and config agree.
        if addr.port() != 0 && !port::is_available(addr.port()) {
            let new_port = port::any_tcp()?;
            log::warn!("gateway port {} in use; reassigned to {new_port}", addr.port());
            addr.set_port(new_port);
            state.cfg.listen.socks = addr.to_string();
            state.cfg.save(&self.inner.paths.config_path())?;
        }

        let gw = Gateway::start(addr, self.target_resolver()).await?;
        state.gateway = Some(gw);
        Ok(())
    }

    async fn start_tunnel_locked(&self, state: &mut EngineState, tag: &str) -> Result<()> {
        let spec = state
            .cfg
            .tunnel(tag)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("tunnel {tag:?} not found")))?;

        let process_name = process_name(tag);
        if self.inner.procs.is_running(&process_name) {
            return Err(Error::Conflict(format!("tunnel {tag:?} is already running")));
        }

        let provider = transport::get(spec.transport)?;
        for binary in provider.required_binaries(spec.backend) {
            if !self.inner.binaries.installed(binary) {
                return Err(Error::Precondition(format!(
                    "binary {binary} not installed — run install first"
                )));
            }
        }

        let is_ssh = spec.backend == BackendKind::Ssh;

        let mut exposed_port = spec.port;
        if exposed_port == 0 {
            exposed_port = extract_port(&state.cfg.listen.socks).unwrap_or(1080);
        }

        // SSH chains two ports: the child gets a fresh internal one and
        // the adapter's SOCKS listener takes the exposed one. Everything
        // else listens on the exposed port directly.
        let transport_port = if is_ssh {
            port::any_tcp()?
        } else {
            if !port::is_available(exposed_port) {
                return Err(Error::Conflict(format!("port {exposed_port} is already in use")));
            }
            exposed_port
        };

        let resolver = match spec.resolver.as_deref().filter(|r| !r.is_empty()) {
            Some(r) => r.to_string(),
            None => match &state.dns_proxy {
                Some(proxy) => proxy.addr().to_string(),
                None => state.cfg.fallback_resolver(&spec),
            },
        };

        let (binary, args) =
            provider.build(&spec, transport_port, &resolver, self.inner.binaries.as_ref())?;

        self.inner.procs.start(&process_name, &binary, &args)?;

        state.tunnels.insert(
            tag.to_string(),
            RunningTunnel {
                spec: spec.clone(),
                process_name: process_name.clone(),
                transport_port,
                exposed_port,
                ssh: None,
            },
        );

        if is_ssh {
            let ssh_block = spec.ssh.clone().unwrap_or_default();
            let ssh_cfg = SshTunnelConfig {
                transport_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, transport_port)),
                socks_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, exposed_port)),
                user: ssh_block.user,
                password: ssh_block.password,
                key_path: ssh_block.key.map(Into::into),
            };
            let engine = self.clone();
            let tag = tag.to_string();
            tokio::spawn(async move {
                engine.bootstrap_ssh(tag, process_name, ssh_cfg).await;
            });
        }

        Ok(())
    }

    /// Runs detached: wait for the transport child to accept, then start
    /// the SSH adapter and install it. On any failure the child is
    /// stopped and the tunnel purged; the outcome is observable only via
    /// status and the log.
    async fn bootstrap_ssh(&self, tag: String, process_name: String, ssh_cfg: SshTunnelConfig) {
        if let Err(e) = wait_for_port(ssh_cfg.transport_addr, TRANSPORT_READY_TIMEOUT).await {
            log::warn!("transport for {tag:?} did not become ready: {e}");
            let _ = self.inner.procs.stop(&process_name).await;
            self.purge_tunnel(&tag).await;
            return;
        }

        let blocking_cfg = ssh_cfg.clone();
        let started = tokio::task::spawn_blocking(move || SshTunnel::start(blocking_cfg)).await;

        match started {
            Ok(Ok(tunnel)) => {
                let tunnel = Arc::new(tunnel);
                let mut state = self.inner.state.write().await;
                match state.tunnels.get_mut(&tag) {
                    Some(rt) => {
                        log::info!("ssh tunnel {tag:?} up on {}", ssh_cfg.socks_addr);
                        rt.ssh = Some(tunnel);
                    }
                    None => {
                        // Tunnel was stopped while we were connecting.
                        drop(state);
                        let _ = tokio::task::spawn_blocking(move || tunnel.stop()).await;
                    }
                }
            }
            Ok(Err(e)) => {
                log::warn!("ssh tunnel {tag:?} failed: {e}");
                let _ = self.inner.procs.stop(&process_name).await;
                self.purge_tunnel(&tag).await;
            }
            Err(e) => {
                log::warn!("ssh tunnel {tag:?} task failed: {e}");
                let _ = self.inner.procs.stop(&process_name).await;
                self.purge_tunnel(&tag).await;
            }
        }
    }

    async fn purge_tunnel(&self, tag: &str) {
        self.inner.state.write().await.tunnels.remove(tag);
    }

    /// A tracked child exited on its own: purge the tunnel it backed.
    async fn purge_exited(&self, name: &str) {
        let mut state = self.inner.state.write().await;
        let tag = state
            .tunnels
            .iter()
            .find(|(_, rt)| rt.process_name == name)
            .map(|(tag, _)| tag.clone());
        let Some(tag) = tag else { return };

        log::warn!("tunnel {tag:?} child exited unexpectedly");
        let ssh = state.tunnels.get(&tag).and_then(|rt| rt.ssh.clone());
        state.tunnels.remove(&tag);
        drop(state);

        if let Some(ssh) = ssh {
            let _ = tokio::task::spawn_blocking(move || ssh.stop()).await;
        }
    }

    fn target_resolver(&self) -> TargetResolver {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                let inner = weak.upgrade()?;
                Engine { inner }.active_target().await
            })
        })
    }
}

fn process_name(tag: &str) -> String {
    format!("tunnel-{tag}")
}

fn extract_port(addr: &str) -> Option<u16> {
    let (_, port) = addr.rsplit_once(':')?;
    port.parse().ok().filter(|p| *p != 0)
}

/// Poll a TCP address until it accepts connections or the deadline passes
pub(crate) async fn wait_for_port(addr: SocketAddr, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if let Ok(Ok(conn)) =
            tokio::time::timeout(READY_DIAL_TIMEOUT, tokio::net::TcpStream::connect(addr)).await
        {
            drop(conn);
            return Ok(());
        }
        tokio::time::sleep(READY_POLL).await;
    }
    Err(Error::Transient(format!("timeout waiting for {addr}")))
}

// The CLI/TUI side talks to "the" engine; registration is process-wide
// with explicit set and clear.

fn current_cell() -> &'static std::sync::RwLock<Option<Engine>> {
    static CURRENT: OnceLock<std::sync::RwLock<Option<Engine>>> = OnceLock::new();
    CURRENT.get_or_init(|| std::sync::RwLock::new(None))
}

/// Register (or clear) the process-wide engine instance
pub fn set_current(engine: Option<Engine>) {
    *current_cell().write().unwrap() = engine;
}

/// The process-wide engine instance, if one is registered
pub fn current() -> Option<Engine> {
    current_cell().read().unwrap().clone()
}
