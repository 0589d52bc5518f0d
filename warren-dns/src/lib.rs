//! warren-dns
//!
//! DNS building blocks for the warren tunnel supervisor:
//!
//! - [`Upstream`]: a single recursive server spoken to over UDP
//! - [`HealthAwareResolver`]: latency-ranked sequential failover across a
//!   pool of upstreams, with background health probing
//! - [`ResponseCache`]: byte-budgeted TTL cache for raw DNS responses
//! - [`DnsServer`]: UDP + TCP serve loops over pre-bound sockets
//!
//! The crate knows nothing about tunnels, child processes, or
//! configuration files; the engine crate composes these pieces into the
//! local DNS proxy.

pub mod cache;
pub mod error;
pub mod health;
pub mod server;
pub mod upstream;

pub use cache::{ResponseCache, DEFAULT_CAPACITY_BYTES, MAX_TTL_SECS, MIN_TTL_SECS};
pub use error::{Error, Result};
pub use health::{HealthAwareResolver, UpstreamHealth};
pub use server::DnsServer;
pub use upstream::{probe_query, Upstream};
