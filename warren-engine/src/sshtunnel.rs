//! SSH-over-tunnel adapter
//!
//! Exposes a local SOCKS5 listener whose every connection is dynamically
//! forwarded through an SSH session. The SSH TCP stream does not go to
//! the Internet: it dials the loopback port of a DNS transport child
//! process, which carries the bytes to the far end.
//!
//! Host keys are deliberately NOT verified. The DNS transport is the
//! trust boundary here; the SSH endpoint is only reachable through it,
//! and a pinning scheme would break every deployment that has never
//! stored a key. Do not add verification without a migration plan.
//!
//! The adapter is synchronous (libssh2) and runs on plain threads; the
//! async engine crosses over with `spawn_blocking`.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ssh2::{KeyboardInteractivePrompt, Prompt, Session};

use crate::error::{Error, Result};
use crate::socks5;

/// Attempts to establish the SSH session before giving up
const CONNECT_ATTEMPTS: u32 = 2;

/// Pause between connect attempts
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// TCP dial + handshake deadline per attempt
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Keepalive interval advertised to libssh2
const KEEPALIVE_INTERVAL_SECS: u32 = 5;

/// Configuration for one SSH tunnel
#[derive(Debug, Clone)]
pub struct SshTunnelConfig {
    /// Loopback address of the DNS transport child process
    pub transport_addr: SocketAddr,
    /// Local SOCKS5 listen address
    pub socks_addr: SocketAddr,
    pub user: String,
    pub password: Option<String>,
    /// Path to a PEM private key file
    pub key_path: Option<PathBuf>,
}

/// Answers every keyboard-interactive prompt with the password
struct PasswordPrompter {
    password: String,
}

impl KeyboardInteractivePrompt for PasswordPrompter {
    fn prompt(&mut self, _username: &str, _instructions: &str, prompts: &[Prompt<'_>]) -> Vec<String> {
        prompts.iter().map(|_| self.password.clone()).collect()
    }
}

/// A running SSH session with its SOCKS5 front
pub struct SshTunnel {
    session: Session,
    local_addr: SocketAddr,
    done: Arc<AtomicBool>,
    accept_handle: Mutex<Option<thread::JoinHandle<()>>>,
    handlers: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
}

impl std::fmt::Debug for SshTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTunnel")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl SshTunnel {
    /// Establish the SSH session and start the SOCKS5 listener.
    ///
    /// Blocking; run under `spawn_blocking` from async code.
    pub fn start(cfg: SshTunnelConfig) -> Result<Self> {
        if cfg.password.is_none() && cfg.key_path.is_none() {
            return Err(Error::Precondition("no SSH auth method configured".into()));
        }

        let session = connect_with_retry(&cfg)?;

        let listener = match TcpListener::bind(cfg.socks_addr) {
            Ok(l) => l,
            Err(e) => {
                let _ = session.disconnect(None, "listener bind failed", None);
                return Err(e.into());
            }
        };
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let done = Arc::new(AtomicBool::new(false));
        let handlers: Arc<Mutex<Vec<thread::JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_session = session.clone();
        let accept_done = done.clone();
        let accept_handlers = handlers.clone();
        let accept_handle = thread::spawn(move || {
            accept_loop(listener, accept_session, accept_done, accept_handlers);
        });

        log::info!("ssh socks5 listener on {local_addr} (via {})", cfg.transport_addr);

        Ok(Self {
            session,
            local_addr,
            done,
            accept_handle: Mutex::new(Some(accept_handle)),
            handlers,
        })
    }

    /// The SOCKS5 listener address
    pub fn addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the SSH session still responds to a keepalive
    pub fn is_alive(&self) -> bool {
        self.session.keepalive_send().is_ok()
    }

    /// Close the listener and the SSH session, then wait for handlers
    pub fn stop(&self) {
        self.done.store(true, Ordering::SeqCst);
        let _ = self.session.disconnect(None, "shutting down", None);

        if let Some(handle) = self.accept_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        let drained = std::mem::take(&mut *self.handlers.lock().unwrap());
        for handle in drained {
            let _ = handle.join();
        }
    }
}

fn connect_with_retry(cfg: &SshTunnelConfig) -> Result<Session> {
    // DNS tunnels may need a moment after the port opens before the
    // session actually relays bytes; one retry covers that window.
    let mut last_err = None;
    for attempt in 0..CONNECT_ATTEMPTS {
        if attempt > 0 {
            thread::sleep(CONNECT_RETRY_DELAY);
        }
        match connect_once(cfg) {
            Ok(session) => return Ok(session),
            Err(e) => {
                log::debug!(
                    "ssh connect attempt {}/{} to {} failed: {e}",
                    attempt + 1,
                    CONNECT_ATTEMPTS,
                    cfg.transport_addr
                );
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| Error::Transient("ssh connect failed".into())))
}

fn connect_once(cfg: &SshTunnelConfig) -> Result<Session> {
    let tcp = TcpStream::connect_timeout(&cfg.transport_addr, CONNECT_TIMEOUT)
        .map_err(|e| Error::Transient(format!("dial transport {}: {e}", cfg.transport_addr)))?;

    let mut session = Session::new()?;
    session.set_tcp_stream(tcp);
    // Bound the handshake; lifted again afterwards so idle tunnels
    // never hit a libssh2 operation timeout.
    session.set_timeout(CONNECT_TIMEOUT.as_millis() as u32);
    session.handshake()?;

    if let Some(key_path) = &cfg.key_path {
        session
            .userauth_pubkey_file(&cfg.user, None, key_path, None)
            .map_err(|e| Error::Upstream(format!("ssh key auth: {e}")))?;
    }
    if !session.authenticated() {
        if let Some(password) = &cfg.password {
            if session.userauth_password(&cfg.user, password).is_err() {
                let mut prompter = PasswordPrompter {
                    password: password.clone(),
                };
                session
                    .userauth_keyboard_interactive(&cfg.user, &mut prompter)
                    .map_err(|e| Error::Upstream(format!("ssh auth: {e}")))?;
            }
        }
    }
    if !session.authenticated() {
        return Err(Error::Upstream("ssh authentication rejected".into()));
    }

    session.set_timeout(0);
    session.set_keepalive(true, KEEPALIVE_INTERVAL_SECS);
    Ok(session)
}

fn accept_loop(
    listener: TcpListener,
    session: Session,
    done: Arc<AtomicBool>,
    handlers: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
) {
    while !done.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let _ = stream.set_nonblocking(false);
                let _ = stream.set_nodelay(true);
                let session = session.clone();
                let handle = thread::spawn(move || {
                    if let Err(e) = handle_conn(session, stream) {
                        log::debug!("socks connection from {peer} ended: {e}");
                    }
                });
                handlers.lock().unwrap().push(handle);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                if done.load(Ordering::SeqCst) {
                    break;
                }
                log::warn!("socks accept error: {e}");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn handle_conn(session: Session, mut stream: TcpStream) -> io::Result<()> {
    let (host, port) = socks5::handshake(&mut stream)?;

    let mut channel = match session.channel_direct_tcpip(&host, port, None) {
        Ok(ch) => ch,
        Err(e) => {
            let _ = socks5::reply(&mut stream, socks5::REP_CONNECTION_REFUSED);
            return Err(io::Error::other(format!("ssh dial {host}:{port}: {e}")));
        }
    };
    socks5::reply(&mut stream, socks5::REP_SUCCESS)?;

    // Independent read/write handles over the same channel and socket.
    let mut chan_read = channel.stream(0);
    let mut chan_write = channel.stream(0);
    let mut conn_read = stream.try_clone()?;

    let uplink = thread::spawn(move || {
        let _ = io::copy(&mut conn_read, &mut chan_write);
    });

    let _ = io::copy(&mut chan_read, &mut stream);
    // Unblock the uplink read before joining it.
    let _ = stream.shutdown(std::net::Shutdown::Both);
    let _ = uplink.join();

    let _ = channel.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_requires_auth_method() {
        let cfg = SshTunnelConfig {
            transport_addr: "127.0.0.1:1".parse().unwrap(),
            socks_addr: "127.0.0.1:0".parse().unwrap(),
            user: "tunnel".to_string(),
            password: None,
            key_path: None,
        };
        let err = SshTunnel::start(cfg).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn test_start_fails_when_transport_is_down() {
        // Grab a port nobody listens on.
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = probe.local_addr().unwrap();
        drop(probe);

        let cfg = SshTunnelConfig {
            transport_addr: dead,
            socks_addr: "127.0.0.1:0".parse().unwrap(),
            user: "tunnel".to_string(),
            password: Some("secret".to_string()),
            key_path: None,
        };
        assert!(SshTunnel::start(cfg).is_err());
    }
}
