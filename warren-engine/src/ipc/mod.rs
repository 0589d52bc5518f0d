//! Daemon IPC: newline-delimited JSON over a local unix socket

mod client;
mod launch;
mod protocol;
mod server;

pub use client::{IpcClient, DIAL_TIMEOUT};
pub use launch::{detect_daemon, ensure_daemon};
pub use protocol::{BoolResult, PingResult, Request, Response, TagParams, MAX_MESSAGE_BYTES};
pub use server::IpcServer;
