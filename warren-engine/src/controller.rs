//! The engine controller contract
//!
//! Two things can drive the runtime: the in-process engine inside the
//! daemon, and an IPC client attached from another process. Callers get
//! one method set and must not depend on which variant they hold.

use crate::config::EngineConfig;
use crate::engine::{Engine, Status};
use crate::error::Result;
use crate::ipc::IpcClient;

/// A handle to the runtime, local or remote
pub enum Controller {
    Local(Engine),
    Ipc(IpcClient),
}

impl Controller {
    pub async fn start(&self) -> Result<()> {
        match self {
            Controller::Local(engine) => engine.start().await,
            Controller::Ipc(client) => client.start().await,
        }
    }

    pub async fn stop(&self) -> Result<()> {
        match self {
            Controller::Local(engine) => engine.stop().await,
            Controller::Ipc(client) => client.stop().await,
        }
    }

    pub async fn start_tunnel(&self, tag: &str) -> Result<()> {
        match self {
            Controller::Local(engine) => engine.start_tunnel(tag).await,
            Controller::Ipc(client) => client.start_tunnel(tag).await,
        }
    }

    pub async fn stop_tunnel(&self, tag: &str) -> Result<()> {
        match self {
            Controller::Local(engine) => engine.stop_tunnel(tag).await,
            Controller::Ipc(client) => client.stop_tunnel(tag).await,
        }
    }

    pub async fn restart_tunnel(&self, tag: &str) -> Result<()> {
        match self {
            Controller::Local(engine) => engine.restart_tunnel(tag).await,
            Controller::Ipc(client) => client.restart_tunnel(tag).await,
        }
    }

    pub async fn activate_tunnel(&self, tag: &str) -> Result<()> {
        match self {
            Controller::Local(engine) => engine.activate_tunnel(tag).await,
            Controller::Ipc(client) => client.activate_tunnel(tag).await,
        }
    }

    pub async fn status(&self) -> Result<Status> {
        match self {
            Controller::Local(engine) => Ok(engine.status().await),
            Controller::Ipc(client) => client.status().await,
        }
    }

    pub async fn get_config(&self) -> Result<EngineConfig> {
        match self {
            Controller::Local(engine) => Ok(engine.get_config().await),
            Controller::Ipc(client) => client.get_config().await,
        }
    }

    pub async fn reload_config(&self) -> Result<()> {
        match self {
            Controller::Local(engine) => engine.reload_config().await,
            Controller::Ipc(client) => client.reload_config().await,
        }
    }

    pub async fn is_connected(&self) -> Result<bool> {
        match self {
            Controller::Local(engine) => Ok(engine.is_connected().await),
            Controller::Ipc(client) => client.is_connected().await,
        }
    }
}
