//! IPC client
//!
//! A short-lived connection to the daemon socket. Calls are serialized
//! over one stream; each request line gets exactly one response line.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::engine::Status;
use crate::error::{Error, Result};
use crate::ipc::protocol::*;

/// Deadline for connecting to the daemon socket
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for a single request/response round trip
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

type Reader = BufReader<tokio::net::unix::OwnedReadHalf>;
type Writer = tokio::net::unix::OwnedWriteHalf;

/// A connected IPC client
pub struct IpcClient {
    io: Mutex<(Reader, Writer)>,
}

impl IpcClient {
    /// Connect to the daemon socket
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = tokio::time::timeout(DIAL_TIMEOUT, UnixStream::connect(socket_path))
            .await
            .map_err(|_| Error::Ipc(format!("timeout connecting to {}", socket_path.display())))?
            .map_err(|e| {
                Error::Ipc(format!(
                    "failed to connect to {}: {e}. Is the daemon running?",
                    socket_path.display()
                ))
            })?;

        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            io: Mutex::new((BufReader::new(read_half), write_half)),
        })
    }

    pub async fn ping(&self) -> Result<PingResult> {
        let result = self.call(METHOD_PING, None).await?;
        decode(result)
    }

    /// Ask the daemon process to exit
    pub async fn shutdown(&self) -> Result<()> {
        self.call(METHOD_SHUTDOWN, None).await.map(|_| ())
    }

    pub async fn start(&self) -> Result<()> {
        self.call(METHOD_START, None).await.map(|_| ())
    }

    pub async fn stop(&self) -> Result<()> {
        self.call(METHOD_STOP, None).await.map(|_| ())
    }

    pub async fn start_tunnel(&self, tag: &str) -> Result<()> {
        self.call_tag(METHOD_START_TUNNEL, tag).await
    }

    pub async fn stop_tunnel(&self, tag: &str) -> Result<()> {
        self.call_tag(METHOD_STOP_TUNNEL, tag).await
    }

    pub async fn restart_tunnel(&self, tag: &str) -> Result<()> {
        self.call_tag(METHOD_RESTART_TUNNEL, tag).await
    }

    pub async fn activate_tunnel(&self, tag: &str) -> Result<()> {
        self.call_tag(METHOD_ACTIVATE_TUNNEL, tag).await
    }

    pub async fn status(&self) -> Result<Status> {
        let result = self.call(METHOD_STATUS, None).await?;
        decode(result)
    }

    pub async fn get_config(&self) -> Result<EngineConfig> {
        let result = self.call(METHOD_GET_CONFIG, None).await?;
        decode(result)
    }

    pub async fn reload_config(&self) -> Result<()> {
        self.call(METHOD_RELOAD_CONFIG, None).await.map(|_| ())
    }

    pub async fn is_connected(&self) -> Result<bool> {
        let result = self.call(METHOD_IS_CONNECTED, None).await?;
        let value: BoolResult = decode(result)?;
        Ok(value.value)
    }

    async fn call_tag(&self, method: &str, tag: &str) -> Result<()> {
        let params = serde_json::to_value(TagParams {
            tag: tag.to_string(),
        })?;
        self.call(method, Some(params)).await.map(|_| ())
    }

    async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<Option<serde_json::Value>> {
        let request = Request {
            method: method.to_string(),
            params,
        };
        let mut data = serde_json::to_vec(&request)?;
        data.push(b'\n');

        let mut io = self.io.lock().await;
        let (reader, writer) = &mut *io;

        writer.write_all(&data).await.map_err(|e| Error::Ipc(format!("write: {e}")))?;

        let mut line = String::new();
        let read = tokio::time::timeout(CALL_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| Error::Ipc("timeout waiting for response".into()))?
            .map_err(|e| Error::Ipc(format!("read: {e}")))?;
        if read == 0 {
            return Err(Error::Ipc("connection closed".into()));
        }
        if line.len() > MAX_MESSAGE_BYTES {
            return Err(Error::Ipc("response too large".into()));
        }

        let response: Response = serde_json::from_str(line.trim())
            .map_err(|e| Error::Ipc(format!("invalid response: {e}")))?;

        if let Some(message) = response.error {
            return Err(Error::Ipc(message));
        }
        Ok(response.result)
    }
}

fn decode<T: serde::de::DeserializeOwned>(result: Option<serde_json::Value>) -> Result<T> {
    let value = result.ok_or_else(|| Error::Ipc("missing result".into()))?;
    serde_json::from_value(value).map_err(|e| Error::Ipc(format!("invalid result: {e}")))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::Paths;
    use crate::engine::Engine;
    use crate::ipc::server::IpcServer;

    async fn start_pair() -> (IpcServer, IpcClient, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::in_dir(dir.path());
        paths.ensure().unwrap();

        let mut cfg = EngineConfig::default();
        // Keep the engine quiet in tests: no resolvers, no tunnels.
        cfg.resolvers.clear();

        let engine = Engine::new(cfg, paths.clone());
        let server = IpcServer::start(paths.socket_path(), "0.0.0-test", engine).unwrap();
        let client = IpcClient::connect(&paths.socket_path()).await.unwrap();
        (server, client, dir)
    }

    #[tokio::test]
    async fn test_ping() {
        let (server, client, _dir) = start_pair().await;
        let pong = client.ping().await.unwrap();
        assert_eq!(pong.version, "0.0.0-test");
        assert_eq!(pong.pid, std::process::id());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_method_is_an_error() {
        let (server, client, _dir) = start_pair().await;
        let err = client.call("frobnicate", None).await.unwrap_err();
        assert!(err.to_string().contains("unknown method"));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_tag_methods_require_tag() {
        let (server, client, _dir) = start_pair().await;

        let err = client.call(METHOD_START_TUNNEL, None).await.unwrap_err();
        assert!(err.to_string().contains("missing params"));

        let err = client
            .call(
                METHOD_START_TUNNEL,
                Some(serde_json::json!({ "tag": "" })),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("tag is required"));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_engine_errors_travel_as_error_field() {
        let (server, client, _dir) = start_pair().await;
        let err = client.activate_tunnel("ghost").await.unwrap_err();
        assert!(err.to_string().contains("not found"));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_status_and_config_round_trip() {
        let (server, client, _dir) = start_pair().await;

        let status = client.status().await.unwrap();
        assert!(status.tunnels.is_empty());
        assert!(status.gateway_addr.is_empty());

        let cfg = client.get_config().await.unwrap();
        assert!(cfg.tunnels.is_empty());

        assert!(!client.is_connected().await.unwrap());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_requests_on_one_connection_are_serial() {
        let (server, client, _dir) = start_pair().await;
        for _ in 0..10 {
            client.ping().await.unwrap();
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_connections_are_independent() {
        let (server, first, dir) = start_pair().await;
        let paths = Paths::in_dir(dir.path());

        let second = IpcClient::connect(&paths.socket_path()).await.unwrap();
        let (a, b) = tokio::join!(first.ping(), second.ping());
        a.unwrap();
        b.unwrap();

        server.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_signals_server() {
        let (server, client, _dir) = start_pair().await;
        let mut requested = server.shutdown_requested();
        client.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), requested.recv())
            .await
            .unwrap()
            .unwrap();
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::in_dir(dir.path());
        paths.ensure().unwrap();
        std::fs::write(paths.socket_path(), b"stale").unwrap();

        let mut cfg = EngineConfig::default();
        cfg.resolvers.clear();
        let engine = Engine::new(cfg, paths.clone());
        let server = IpcServer::start(paths.socket_path(), "0.0.0-test", engine).unwrap();

        let client = IpcClient::connect(&paths.socket_path()).await.unwrap();
        client.ping().await.unwrap();
        server.stop().await;
        assert!(!paths.socket_path().exists());
    }
}
