//! warren-engine
//!
//! The runtime engine behind the warren DNS-tunneling supervisor.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  warren-cli (daemon entry, attach commands)              │
//! │            │ unix socket, line-delimited JSON            │
//! │  ┌─────────▼─────────────────────────────────────────┐   │
//! │  │ ipc::IpcServer ──► Engine                         │   │
//! │  │   Engine owns:                                    │   │
//! │  │    - config (JSON on disk)                        │   │
//! │  │    - DnsProxy   (warren-dns, health failover)     │   │
//! │  │    - Gateway    (stable TCP relay port)           │   │
//! │  │    - ProcessManager (transport child processes)   │   │
//! │  │    - SshTunnel per ssh-backed tunnel (SOCKS5)     │   │
//! │  └───────────────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Client traffic enters at the gateway and is relayed, unparsed, to the
//! active tunnel's exposed port: either the transport child's own SOCKS
//! listener, the in-process SSH SOCKS5 adapter, or a Shadowsocks client
//! chaining the transport as a SIP003 plugin.

pub mod binaries;
pub mod config;
pub mod controller;
pub mod dnsproxy;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod ipc;
pub mod port;
pub mod process;
pub mod socks5;
pub mod sshtunnel;
pub mod transport;

pub use binaries::{BinaryResolver, DirResolver};
pub use config::{BackendKind, EngineConfig, Paths, TransportKind, TunnelSpec};
pub use controller::Controller;
pub use engine::{Engine, Status, TunnelStatus};
pub use error::{Error, Result};
pub use ipc::{detect_daemon, ensure_daemon, IpcClient, IpcServer};
pub use process::{ProcessEntry, ProcessManager};
