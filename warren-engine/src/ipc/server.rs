//! IPC server
//!
//! Accepts connections on a unix socket under the config dir and
//! dispatches newline-framed JSON requests to the engine. Connections
//! are independent; each one processes its requests serially in arrival
//! order.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::ipc::protocol::*;

/// The running IPC server
pub struct IpcServer {
    socket_path: PathBuf,
    shutdown_tx: broadcast::Sender<()>,
    /// Fires when a client calls the `shutdown` method
    exit_tx: broadcast::Sender<()>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    engine: Engine,
    version: String,
    exit_tx: broadcast::Sender<()>,
}

impl IpcServer {
    /// Remove any stale socket, bind, restrict permissions, and serve
    pub fn start(socket_path: PathBuf, version: &str, engine: Engine) -> Result<Self> {
        if socket_path.exists() {
            let _ = std::fs::remove_file(&socket_path);
        }
        if let Some(dir) = socket_path.parent() {
            crate::config::create_private_dir(dir)?;
        }

        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| Error::Ipc(format!("failed to listen on {}: {e}", socket_path.display())))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (exit_tx, _) = broadcast::channel(1);

        let shared = Arc::new(Shared {
            engine,
            version: version.to_string(),
            exit_tx: exit_tx.clone(),
        });
        let accept_handle = tokio::spawn(accept_loop(listener, shared, shutdown_rx));

        log::info!("ipc listening on {}", socket_path.display());

        Ok(Self {
            socket_path,
            shutdown_tx,
            exit_tx,
            accept_handle: Mutex::new(Some(accept_handle)),
        })
    }

    /// A receiver that fires when a client requests daemon shutdown
    pub fn shutdown_requested(&self) -> broadcast::Receiver<()> {
        self.exit_tx.subscribe()
    }

    /// Close the listener, let active handlers finish, unlink the socket
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let handle = self.accept_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

async fn accept_loop(
    listener: UnixListener,
    shared: Arc<Shared>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut conns = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let shared = shared.clone();
                        let mut conn_shutdown = shutdown_rx.resubscribe();
                        conns.spawn(async move {
                            if let Err(e) = handle_conn(stream, shared, &mut conn_shutdown).await {
                                log::debug!("ipc connection ended: {e}");
                            }
                        });
                    }
                    Err(e) => log::warn!("ipc accept error: {e}"),
                }
            }
        }
    }

    drop(listener);
    while conns.join_next().await.is_some() {}
}

async fn handle_conn(
    stream: UnixStream,
    shared: Arc<Shared>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    // The limit bounds how much an unterminated line can buffer; it is
    // reset for every frame.
    let mut reader = BufReader::new(read_half).take(MAX_MESSAGE_BYTES as u64 + 1);
    let mut line = String::new();

    loop {
        line.clear();
        reader.set_limit(MAX_MESSAGE_BYTES as u64 + 1);
        let read = tokio::select! {
            _ = shutdown_rx.recv() => return Ok(()),
            read = reader.read_line(&mut line) => read?,
        };
        if read == 0 {
            return Ok(()); // client closed
        }
        if line.len() > MAX_MESSAGE_BYTES {
            // Oversized frame; the stream is no longer in sync.
            write_response(
                &mut write_half,
                &Response {
                    result: None,
                    error: Some("request too large".to_string()),
                },
            )
            .await?;
            return Ok(());
        }

        let response = match serde_json::from_str::<Request>(line.trim()) {
            Ok(request) => dispatch(&shared, request).await,
            Err(_) => Response {
                result: None,
                error: Some("invalid request".to_string()),
            },
        };
        write_response(&mut write_half, &response).await?;
    }
}

async fn write_response(
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
    response: &Response,
) -> Result<()> {
    let mut data = serde_json::to_vec(response)?;
    data.push(b'\n');
    write_half.write_all(&data).await?;
    Ok(())
}

async fn dispatch(shared: &Shared, request: Request) -> Response {
    let engine = &shared.engine;
    match request.method.as_str() {
        METHOD_PING => result_json(&PingResult {
            version: shared.version.clone(),
            pid: std::process::id(),
        }),

        METHOD_SHUTDOWN => {
            let _ = shared.exit_tx.send(());
            ok()
        }

        METHOD_START => from_result(engine.start().await),
        METHOD_STOP => from_result(engine.stop().await),
        METHOD_RELOAD_CONFIG => from_result(engine.reload_config().await),

        METHOD_START_TUNNEL => match parse_tag(&request) {
            Ok(tag) => from_result(engine.start_tunnel(&tag).await),
            Err(e) => error_response(&e),
        },
        METHOD_STOP_TUNNEL => match parse_tag(&request) {
            Ok(tag) => from_result(engine.stop_tunnel(&tag).await),
            Err(e) => error_response(&e),
        },
        METHOD_RESTART_TUNNEL => match parse_tag(&request) {
            Ok(tag) => from_result(engine.restart_tunnel(&tag).await),
            Err(e) => error_response(&e),
        },
        METHOD_ACTIVATE_TUNNEL => match parse_tag(&request) {
            Ok(tag) => from_result(engine.activate_tunnel(&tag).await),
            Err(e) => error_response(&e),
        },

        METHOD_STATUS => result_json(&engine.status().await),
        METHOD_GET_CONFIG => result_json(&engine.get_config().await),
        METHOD_IS_CONNECTED => result_json(&BoolResult {
            value: engine.is_connected().await,
        }),

        other => Response {
            result: None,
            error: Some(format!("unknown method: {other}")),
        },
    }
}

fn parse_tag(request: &Request) -> Result<String> {
    let params = request
        .params
        .clone()
        .ok_or_else(|| Error::Ipc("missing params".into()))?;
    let params: TagParams =
        serde_json::from_value(params).map_err(|e| Error::Ipc(format!("invalid params: {e}")))?;
    if params.tag.is_empty() {
        return Err(Error::Ipc("tag is required".into()));
    }
    Ok(params.tag)
}

fn ok() -> Response {
    Response::default()
}

fn from_result(result: Result<()>) -> Response {
    match result {
        Ok(()) => ok(),
        Err(e) => error_response(&e),
    }
}

fn error_response(error: &Error) -> Response {
    Response {
        result: None,
        error: Some(error.to_string()),
    }
}

fn result_json<T: serde::Serialize>(value: &T) -> Response {
    match serde_json::to_value(value) {
        Ok(result) => Response {
            result: Some(result),
            error: None,
        },
        Err(e) => Response {
            result: None,
            error: Some(e.to_string()),
        },
    }
}
