//! DNSTT transport provider

use std::path::PathBuf;

use crate::binaries::{BinaryResolver, BIN_DNSTT};
use crate::config::{BackendKind, TransportKind, TunnelSpec};
use crate::error::{Error, Result};

/// dnstt-client: raw TCP over DNS, keyed by the server's public key
pub struct Dnstt;

impl super::Transport for Dnstt {
    fn kind(&self) -> TransportKind {
        TransportKind::Dnstt
    }

    fn display_name(&self) -> &'static str {
        "DNSTT"
    }

    fn supported_backends(&self) -> &'static [BackendKind] {
        // No SIP003 plugin mode; SSH rides the raw TCP port.
        &[BackendKind::Socks, BackendKind::Ssh]
    }

    fn required_binaries(&self, _backend: BackendKind) -> Vec<&'static str> {
        vec![BIN_DNSTT]
    }

    fn validate(&self, spec: &TunnelSpec) -> Result<()> {
        if spec.domain.is_empty() {
            return Err(Error::Precondition("domain is required".into()));
        }
        let pubkey = spec
            .dnstt
            .as_ref()
            .map(|d| d.pubkey.as_str())
            .unwrap_or("");
        if pubkey.is_empty() {
            return Err(Error::Precondition("pubkey is required for dnstt".into()));
        }
        if pubkey.len() != 64 || !pubkey.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Precondition(
                "pubkey must be 64 hex characters (32 bytes)".into(),
            ));
        }
        Ok(())
    }

    fn build(
        &self,
        spec: &TunnelSpec,
        listen_port: u16,
        resolver: &str,
        binaries: &dyn BinaryResolver,
    ) -> Result<(PathBuf, Vec<String>)> {
        self.validate(spec)?;

        let pubkey = spec.dnstt.as_ref().map(|d| d.pubkey.clone()).unwrap_or_default();
        let args = vec![
            "-udp".to_string(),
            resolver.to_string(),
            "-pubkey".to_string(),
            pubkey,
            spec.domain.clone(),
            format!("127.0.0.1:{listen_port}"),
        ];

        Ok((binaries.resolve(BIN_DNSTT)?, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DnsttBlock;
    use crate::transport::Transport;
    use std::path::Path;

    struct FixedResolver;

    impl BinaryResolver for FixedResolver {
        fn resolve(&self, name: &str) -> Result<PathBuf> {
            Ok(Path::new("/opt/warren/bin").join(name))
        }
    }

    fn spec(pubkey: &str) -> TunnelSpec {
        TunnelSpec {
            tag: "dnstt-one".to_string(),
            enabled: None,
            transport: TransportKind::Dnstt,
            backend: BackendKind::Socks,
            domain: "t.example.com".to_string(),
            port: 0,
            resolver: None,
            slipstream: None,
            dnstt: Some(DnsttBlock {
                pubkey: pubkey.to_string(),
            }),
            shadowsocks: None,
            ssh: None,
        }
    }

    #[test]
    fn test_argv_shape() {
        let key = "0f".repeat(32);
        let (binary, args) = Dnstt
            .build(&spec(&key), 9000, "127.0.0.1:5300", &FixedResolver)
            .unwrap();
        assert_eq!(binary, Path::new("/opt/warren/bin/dnstt-client"));
        assert_eq!(
            args,
            vec![
                "-udp".to_string(),
                "127.0.0.1:5300".to_string(),
                "-pubkey".to_string(),
                key,
                "t.example.com".to_string(),
                "127.0.0.1:9000".to_string(),
            ]
        );
    }

    #[test]
    fn test_pubkey_length_enforced() {
        assert!(Dnstt.validate(&spec("ab")).is_err());
        assert!(Dnstt.validate(&spec(&"g".repeat(64))).is_err());
        assert!(Dnstt.validate(&spec(&"ab".repeat(32))).is_ok());
    }

    #[test]
    fn test_missing_pubkey_block() {
        let mut s = spec("");
        s.dnstt = None;
        assert!(Dnstt.validate(&s).is_err());
    }
}
