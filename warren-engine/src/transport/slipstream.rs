//! Slipstream transport provider

use std::path::PathBuf;

use crate::binaries::{BinaryResolver, BIN_SLIPSTREAM, BIN_SSLOCAL};
use crate::config::{BackendKind, TransportKind, TunnelSpec};
use crate::error::{Error, Result};

/// Slipstream client, standalone or as a SIP003 plugin under sslocal
pub struct Slipstream;

impl super::Transport for Slipstream {
    fn kind(&self) -> TransportKind {
        TransportKind::Slipstream
    }

    fn display_name(&self) -> &'static str {
        "Slipstream"
    }

    fn supported_backends(&self) -> &'static [BackendKind] {
        &[BackendKind::Socks, BackendKind::Ssh, BackendKind::Shadowsocks]
    }

    fn required_binaries(&self, backend: BackendKind) -> Vec<&'static str> {
        match backend {
            BackendKind::Shadowsocks => vec![BIN_SSLOCAL, BIN_SLIPSTREAM],
            _ => vec![BIN_SLIPSTREAM],
        }
    }

    fn validate(&self, spec: &TunnelSpec) -> Result<()> {
        if spec.domain.is_empty() {
            return Err(Error::Precondition("domain is required".into()));
        }
        // Cert is optional; shadowsocks fields are checked by config
        // validation where the backend block is required.
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
        match spec.backend {
            BackendKind::Shadowsocks => build_sip003(spec, listen_port, resolver, binaries),
            _ => build_socks(spec, listen_port, resolver, binaries),
        }
    }
}

/// Standalone SOCKS mode: the slipstream client listens locally itself
fn build_socks(
    spec: &TunnelSpec,
    listen_port: u16,
    resolver: &str,
    binaries: &dyn BinaryResolver,
) -> Result<(PathBuf, Vec<String>)> {
    let mut args = vec![
        "--domain".to_string(),
        spec.domain.clone(),
        "--resolver".to_string(),
        resolver.to_string(),
        "--tcp-listen-port".to_string(),
        listen_port.to_string(),
    ];

    if let Some(cert) = spec.slipstream.as_ref().and_then(|s| s.cert.as_ref()) {
        if !cert.is_empty() {
            args.push("--cert".to_string());
            args.push(cert.clone());
        }
    }

    Ok((binaries.resolve(BIN_SLIPSTREAM)?, args))
}

/// SIP003 mode: sslocal is the child, slipstream rides as its plugin
fn build_sip003(
    spec: &TunnelSpec,
    listen_port: u16,
    resolver: &str,
    binaries: &dyn BinaryResolver,
) -> Result<(PathBuf, Vec<String>)> {
    let ss = spec
        .shadowsocks
        .as_ref()
        .ok_or_else(|| Error::Precondition("shadowsocks config is required".into()))?;

    let method = if ss.method.is_empty() {
        "aes-256-gcm"
    } else {
        ss.method.as_str()
    };

    let plugin = binaries.resolve(BIN_SLIPSTREAM)?;
    let args = vec![
        "-s".to_string(),
        ss.server.clone(),
        "-k".to_string(),
        ss.password.clone(),
        "-m".to_string(),
        method.to_string(),
        "-b".to_string(),
        format!("127.0.0.1:{listen_port}"),
        "--plugin".to_string(),
        plugin.to_string_lossy().into_owned(),
        "--plugin-opts".to_string(),
        format!("domain={};resolver={};", spec.domain, resolver),
    ];

    Ok((binaries.resolve(BIN_SSLOCAL)?, args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ShadowsocksBlock, SlipstreamBlock};
    use crate::transport::Transport;
    use std::path::Path;

    struct FixedResolver;

    impl BinaryResolver for FixedResolver {
        fn resolve(&self, name: &str) -> Result<PathBuf> {
            Ok(Path::new("/opt/warren/bin").join(name))
        }
    }

    fn spec() -> TunnelSpec {
        TunnelSpec {
            tag: "slip-one".to_string(),
            enabled: None,
            transport: TransportKind::Slipstream,
            backend: BackendKind::Socks,
            domain: "t.example.com".to_string(),
            port: 0,
            resolver: None,
            slipstream: None,
            dnstt: None,
            shadowsocks: None,
            ssh: None,
        }
    }

    #[test]
    fn test_socks_argv() {
        let (binary, args) = Slipstream
            .build(&spec(), 7000, "127.0.0.1:5353", &FixedResolver)
            .unwrap();
        assert_eq!(binary, Path::new("/opt/warren/bin/slipstream-client"));
        assert_eq!(
            args,
            vec![
                "--domain",
                "t.example.com",
                "--resolver",
                "127.0.0.1:5353",
                "--tcp-listen-port",
                "7000",
            ]
        );
    }

    #[test]
    fn test_socks_argv_with_cert() {
        let mut s = spec();
        s.slipstream = Some(SlipstreamBlock {
            cert: Some("/tmp/server.crt".to_string()),
        });
        let (_, args) = Slipstream
            .build(&s, 7000, "1.1.1.1:53", &FixedResolver)
            .unwrap();
        assert!(args.windows(2).any(|w| w == ["--cert", "/tmp/server.crt"]));
    }

    #[test]
    fn test_sip003_argv() {
        let mut s = spec();
        s.backend = BackendKind::Shadowsocks;
        s.shadowsocks = Some(ShadowsocksBlock {
            server: "ss.example.com:8388".to_string(),
            password: "hunter2".to_string(),
            method: String::new(),
        });

        let (binary, args) = Slipstream
            .build(&s, 1080, "9.9.9.9:53", &FixedResolver)
            .unwrap();
        assert_eq!(binary, Path::new("/opt/warren/bin/sslocal"));
        assert!(args.windows(2).any(|w| w == ["-m", "aes-256-gcm"]));
        assert!(args.windows(2).any(|w| w == ["-b", "127.0.0.1:1080"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["--plugin", "/opt/warren/bin/slipstream-client"]));
        assert!(args
            .iter()
            .any(|a| a == "domain=t.example.com;resolver=9.9.9.9:53;"));
    }

    #[test]
    fn test_missing_domain_rejected() {
        let mut s = spec();
        s.domain.clear();
        assert!(Slipstream.validate(&s).is_err());
    }
}
