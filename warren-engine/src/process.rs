//! Child process lifecycle management
//!
//! Tracks transport child processes by logical name and persists the pid
//! table so a restarted daemon can find (and clean up) processes from a
//! previous run. Every started child gets a dedicated reaper task that
//! only waits for the exit and then prunes the table; reapers never take
//! any lock but the manager's own.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::config::{create_private_dir, restrict_file_mode};
use crate::error::{Error, Result};

/// How long a graceful stop waits before force-killing
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Liveness poll interval while waiting for a graceful exit
const STOP_POLL: Duration = Duration::from_millis(100);

/// A tracked child process, as persisted on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub name: String,
    pub pid: u32,
    pub binary: PathBuf,
    pub args: Vec<String>,
    /// Unix timestamp, seconds
    pub started: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    processes: Vec<ProcessEntry>,
}

struct Inner {
    entries: HashMap<String, ProcessEntry>,
    /// Force-kill handles for children spawned by this manager.
    /// Orphans adopted from the state file have none.
    kills: HashMap<String, oneshot::Sender<()>>,
}

/// Starts, stops, and monitors external child processes
pub struct ProcessManager {
    state_path: PathBuf,
    inner: Mutex<Inner>,
    exited_tx: mpsc::UnboundedSender<String>,
    exited_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl ProcessManager {
    /// Create a manager, loading the persisted table and silently
    /// discarding entries whose pid is no longer alive.
    pub fn new(state_path: impl Into<PathBuf>) -> Arc<Self> {
        let state_path = state_path.into();
        let entries = load_state(&state_path);
        let (exited_tx, exited_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            state_path,
            inner: Mutex::new(Inner {
                entries,
                kills: HashMap::new(),
            }),
            exited_tx,
            exited_rx: Mutex::new(Some(exited_rx)),
        })
    }

    /// Take the stream of exited process names. Single consumer; the
    /// engine drains it to purge dead tunnels.
    pub fn take_exit_events(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.exited_rx.lock().unwrap().take()
    }

    /// Spawn a child and begin tracking it
    pub fn start(self: &Arc<Self>, name: &str, binary: &Path, args: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(entry) = inner.entries.get(name) {
            if pid_alive(entry.pid) {
                return Err(Error::Conflict(format!("process {name} is already running")));
            }
        }

        let mut child = tokio::process::Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Io(std::io::Error::new(e.kind(), format!("failed to start {name}: {e}"))))?;

        let pid = child
            .id()
            .ok_or_else(|| Error::Transient(format!("{name} exited before it could be tracked")))?;

        let entry = ProcessEntry {
            name: name.to_string(),
            pid,
            binary: binary.to_path_buf(),
            args: args.to_vec(),
            started: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };

        let (kill_tx, mut kill_rx) = oneshot::channel();
        inner.entries.insert(name.to_string(), entry);
        inner.kills.insert(name.to_string(), kill_tx);
        self.persist_locked(&inner);
        drop(inner);

        let manager = self.clone();
        let reap_name = name.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = child.wait() => {}
                res = &mut kill_rx => {
                    if res.is_ok() {
                        let _ = child.start_kill();
                    }
                    let _ = child.wait().await;
                }
            }
            manager.reap(&reap_name, pid);
        });

        Ok(())
    }

    /// Best-effort graceful stop: SIGTERM, wait, then force-kill
    pub async fn stop(&self, name: &str) -> Result<()> {
        let (entry, kill_tx) = {
            let mut inner = self.inner.lock().unwrap();
            let Some(entry) = inner.entries.get(name).cloned() else {
                return Ok(());
            };
            (entry, inner.kills.remove(name))
        };

        #[cfg(unix)]
        {
            if terminate(entry.pid) {
                let deadline = tokio::time::Instant::now() + STOP_GRACE;
                while pid_alive(entry.pid) && tokio::time::Instant::now() < deadline {
                    tokio::time::sleep(STOP_POLL).await;
                }
            }
            if pid_alive(entry.pid) {
                force_kill(entry.pid, kill_tx);
            }
        }

        #[cfg(not(unix))]
        {
            force_kill(entry.pid, kill_tx);
        }

        let mut inner = self.inner.lock().unwrap();
        if inner
            .entries
            .get(name)
            .map(|e| e.pid == entry.pid)
            .unwrap_or(false)
        {
            inner.entries.remove(name);
            inner.kills.remove(name);
            self.persist_locked(&inner);
        }
        Ok(())
    }

    /// Stop every tracked process
    pub async fn stop_all(&self) -> Result<()> {
        let names: Vec<String> = self.inner.lock().unwrap().entries.keys().cloned().collect();
        let mut last_err = None;
        for name in names {
            if let Err(e) = self.stop(&name).await {
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether a tracked process is still live
    pub fn is_running(&self, name: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .get(name)
            .map(|e| pid_alive(e.pid))
            .unwrap_or(false)
    }

    /// name → alive for every tracked process
    pub fn status(&self) -> HashMap<String, bool> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter()
            .map(|(name, entry)| (name.clone(), pid_alive(entry.pid)))
            .collect()
    }

    /// Snapshot of one tracked process
    pub fn info(&self, name: &str) -> Option<ProcessEntry> {
        self.inner.lock().unwrap().entries.get(name).cloned()
    }

    /// Called by a reaper when its child exits. Only prunes the entry if
    /// it still refers to the reaped pid; a restart may have replaced it.
    fn reap(&self, name: &str, pid: u32) {
        let mut inner = self.inner.lock().unwrap();
        let matches = inner.entries.get(name).map(|e| e.pid == pid).unwrap_or(false);
        if matches {
            inner.entries.remove(name);
            inner.kills.remove(name);
            self.persist_locked(&inner);
            let _ = self.exited_tx.send(name.to_string());
        }
    }

    fn persist_locked(&self, inner: &Inner) {
        let state = StateFile {
            processes: inner.entries.values().cloned().collect(),
        };
        if let Err(e) = write_state(&self.state_path, &state) {
            log::warn!("failed to persist process table: {e}");
        }
    }
}

fn load_state(path: &Path) -> HashMap<String, ProcessEntry> {
    let Ok(data) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    let Ok(state) = serde_json::from_str::<StateFile>(&data) else {
        return HashMap::new();
    };

    state
        .processes
        .into_iter()
        .filter(|entry| pid_alive(entry.pid))
        .map(|entry| (entry.name.clone(), entry))
        .collect()
}

fn write_state(path: &Path, state: &StateFile) -> Result<()> {
    if let Some(dir) = path.parent() {
        create_private_dir(dir)?;
    }
    let mut data = serde_json::to_string_pretty(state)?;
    data.push('\n');
    std::fs::write(path, data)?;
    restrict_file_mode(path)?;
    Ok(())
}

/// Zero-signal liveness probe on unix; presence elsewhere
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(unix)]
fn terminate(pid: u32) -> bool {
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGTERM,
    )
    .is_ok()
}

#[cfg(unix)]
fn force_kill(pid: u32, _kill_tx: Option<oneshot::Sender<()>>) {
    let _ = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    );
}

#[cfg(not(unix))]
fn force_kill(_pid: u32, kill_tx: Option<oneshot::Sender<()>>) {
    if let Some(tx) = kill_tx {
        let _ = tx.send(());
    }
}
