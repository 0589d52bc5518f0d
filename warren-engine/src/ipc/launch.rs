//! Daemon detection and launch
//!
//! A short-lived CLI invocation either attaches to a running daemon or
//! spawns one: the current executable re-invoked in daemon-supervisor
//! mode, detached into its own session with output going to the daemon
//! log file.

use std::time::Duration;

use crate::config::Paths;
use crate::error::{Error, Result};
use crate::ipc::client::IpcClient;

/// Total deadline for a freshly spawned daemon to become ready
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll cadence while waiting for readiness
const LAUNCH_POLL: Duration = Duration::from_millis(200);

/// Detect a running daemon: stat the socket, dial it, ping it.
///
/// A socket that fails to dial or to answer a ping is stale; it is
/// unlinked before reporting that no daemon is running.
pub async fn detect_daemon(paths: &Paths) -> Option<IpcClient> {
    let socket_path = paths.socket_path();
    if !socket_path.exists() {
        return None;
    }

    let Ok(client) = IpcClient::connect(&socket_path).await else {
        let _ = std::fs::remove_file(&socket_path);
        return None;
    };

    if client.ping().await.is_err() {
        let _ = std::fs::remove_file(&socket_path);
        return None;
    }

    Some(client)
}

/// Return a client to a running daemon, spawning one if necessary
pub async fn ensure_daemon(paths: &Paths) -> Result<IpcClient> {
    if let Some(client) = detect_daemon(paths).await {
        return Ok(client);
    }

    let exe = std::env::current_exe()
        .map_err(|e| Error::Ipc(format!("failed to determine executable path: {e}")))?;
    paths.ensure()?;

    let log_path = paths.daemon_log_path();
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    crate::config::restrict_file_mode(&log_path)?;

    let mut command = std::process::Command::new(exe);
    command
        .args(["daemon", "run"])
        .stdin(std::process::Stdio::null())
        .stdout(log_file.try_clone()?)
        .stderr(log_file);

    // Detach into a fresh session so the daemon survives the CLI.
    #[cfg(unix)]
    unsafe {
        use std::os::unix::process::CommandExt;
        command.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            Ok(())
        });
    }

    let mut child = command
        .spawn()
        .map_err(|e| Error::Ipc(format!("failed to spawn daemon: {e}")))?;
    // Reap without waiting; the daemon outlives us in the normal case.
    std::thread::spawn(move || {
        let _ = child.wait();
    });

    let deadline = tokio::time::Instant::now() + LAUNCH_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(LAUNCH_POLL).await;
        if let Some(client) = detect_daemon(paths).await {
            return Ok(client);
        }
    }

    Err(Error::Transient(format!(
        "daemon did not start within {}s (check {})",
        LAUNCH_TIMEOUT.as_secs(),
        log_path.display()
    )))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_detect_without_socket() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::in_dir(dir.path());
        assert!(detect_daemon(&paths).await.is_none());
    }

    #[tokio::test]
    async fn test_detect_unlinks_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::in_dir(dir.path());
        paths.ensure().unwrap();

        // A plain file where the socket should be: dialing fails, and the
        // stale path must be cleaned up.
        std::fs::write(paths.socket_path(), b"stale").unwrap();
        assert!(detect_daemon(&paths).await.is_none());
        assert!(!paths.socket_path().exists());
    }

    #[tokio::test]
    async fn test_detect_unlinks_unanswered_socket() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::in_dir(dir.path());
        paths.ensure().unwrap();

        // A listener that accepts and immediately closes: ping fails.
        let listener = tokio::net::UnixListener::bind(paths.socket_path()).unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        assert!(detect_daemon(&paths).await.is_none());
        assert!(!paths.socket_path().exists());
    }
}
