//! Transport provider registry
//!
//! Each DNS-tunneling transport is an opaque child binary; a provider
//! knows how to validate its tunnel spec and build its command line. The
//! registry is built once at first use and is read-only afterwards.

use std::path::PathBuf;
use std::sync::OnceLock;

use crate::binaries::BinaryResolver;
use crate::config::{BackendKind, TransportKind, TunnelSpec};
use crate::error::{Error, Result};

mod dnstt;
mod slipstream;

pub use dnstt::Dnstt;
pub use slipstream::Slipstream;

/// A DNS-tunneling transport provider
pub trait Transport: Send + Sync {
    /// Transport kind identifier
    fn kind(&self) -> TransportKind;

    /// Human-readable name
    fn display_name(&self) -> &'static str;

    /// Backends this transport can carry
    fn supported_backends(&self) -> &'static [BackendKind];

    /// Binaries that must be installed for the given backend
    fn required_binaries(&self, backend: BackendKind) -> Vec<&'static str>;

    /// Reject malformed tunnel specs
    fn validate(&self, spec: &TunnelSpec) -> Result<()>;

    /// Build the child command line: the transport process listens on
    /// `127.0.0.1:<listen_port>` and tunnels over `resolver`
    fn build(
        &self,
        spec: &TunnelSpec,
        listen_port: u16,
        resolver: &str,
        binaries: &dyn BinaryResolver,
    ) -> Result<(PathBuf, Vec<String>)>;
}

fn registry() -> &'static [Box<dyn Transport>] {
    static REGISTRY: OnceLock<Vec<Box<dyn Transport>>> = OnceLock::new();
    REGISTRY.get_or_init(|| vec![Box::new(Slipstream), Box::new(Dnstt)])
}

/// Look up a transport provider by kind
pub fn get(kind: TransportKind) -> Result<&'static dyn Transport> {
    registry()
        .iter()
        .find(|t| t.kind() == kind)
        .map(|t| t.as_ref())
        .ok_or_else(|| Error::NotFound(format!("unknown transport: {kind}")))
}

/// All registered providers
pub fn all() -> impl Iterator<Item = &'static dyn Transport> {
    registry().iter().map(|t| t.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_has_both_transports() {
        assert_eq!(all().count(), 2);
        assert_eq!(get(TransportKind::Slipstream).unwrap().display_name(), "Slipstream");
        assert_eq!(get(TransportKind::Dnstt).unwrap().display_name(), "DNSTT");
    }

    #[test]
    fn test_backend_support_matrix() {
        let slipstream = get(TransportKind::Slipstream).unwrap();
        assert!(slipstream.supported_backends().contains(&BackendKind::Socks));
        assert!(slipstream.supported_backends().contains(&BackendKind::Ssh));
        assert!(slipstream.supported_backends().contains(&BackendKind::Shadowsocks));

        let dnstt = get(TransportKind::Dnstt).unwrap();
        assert!(dnstt.supported_backends().contains(&BackendKind::Socks));
        assert!(dnstt.supported_backends().contains(&BackendKind::Ssh));
        assert!(!dnstt.supported_backends().contains(&BackendKind::Shadowsocks));
    }
}
