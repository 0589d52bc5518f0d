//! Configuration model and persistence
//!
//! The config file is pretty-printed JSON under the warren config
//! directory. Saves are full-file rewrites with 0640 permissions; the
//! directory is created 0750. Loading applies defaults and validates.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fallback DNS resolver used when none is configured
pub const DEFAULT_RESOLVER: &str = "1.1.1.1:53";

/// Default gateway listen address
pub const DEFAULT_SOCKS_LISTEN: &str = "127.0.0.1:1080";

/// Registered DNS-tunneling transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Slipstream,
    Dnstt,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Slipstream => write!(f, "slipstream"),
            TransportKind::Dnstt => write!(f, "dnstt"),
        }
    }
}

/// How client traffic enters a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The transport's own SOCKS listener is exposed directly
    Socks,
    /// An in-process SOCKS5 server forwards through SSH carried by the transport
    Ssh,
    /// A Shadowsocks client chains the transport as a SIP003 plugin
    Shadowsocks,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Socks => write!(f, "socks"),
            BackendKind::Ssh => write!(f, "ssh"),
            BackendKind::Shadowsocks => write!(f, "shadowsocks"),
        }
    }
}

/// Slipstream-specific settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlipstreamBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<String>,
}

/// DNSTT-specific settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsttBlock {
    /// Server public key, 64 hex characters
    #[serde(default)]
    pub pubkey: String,
}

/// Shadowsocks settings for SIP003 mode
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShadowsocksBlock {
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
}

/// SSH backend credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshBlock {
    #[serde(default)]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Path to a PEM private key file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Immutable snapshot of one tunnel's configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSpec {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    pub transport: TransportKind,
    pub backend: BackendKind,
    pub domain: String,
    #[serde(default, skip_serializing_if = "is_zero_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slipstream: Option<SlipstreamBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dnstt: Option<DnsttBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadowsocks: Option<ShadowsocksBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshBlock>,
}

fn is_zero_port(port: &u16) -> bool {
    *port == 0
}

impl TunnelSpec {
    /// Absent `enabled` means enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSection {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenSection {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub socks: String,
}

impl Default for ListenSection {
    fn default() -> Self {
        Self {
            socks: DEFAULT_SOCKS_LISTEN.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteSection {
    /// Tag of the tunnel the gateway forwards to; empty means none
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub active: String,
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub log: LogSection,
    #[serde(default)]
    pub listen: ListenSection,
    #[serde(default)]
    pub resolvers: Vec<String>,
    #[serde(default)]
    pub tunnels: Vec<TunnelSpec>,
    #[serde(default)]
    pub route: RouteSection,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log: LogSection::default(),
            listen: ListenSection::default(),
            resolvers: vec![DEFAULT_RESOLVER.to_string()],
            tunnels: Vec::new(),
            route: RouteSection::default(),
        }
    }
}

impl EngineConfig {
    /// Read, default-fill, and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::Config(format!("config file not found: {}", path.display()))
            } else {
                Error::Config(format!("failed to read config: {e}"))
            }
        })?;

        let mut cfg: EngineConfig = serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;
        cfg.apply_defaults();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Like [`load`](Self::load), but a missing file yields the default config
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Full-file rewrite, pretty JSON, 0640 (directory 0750)
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            create_private_dir(dir)?;
        }

        let mut data = serde_json::to_string_pretty(self)?;
        data.push('\n');
        std::fs::write(path, data)?;
        restrict_file_mode(path)?;
        Ok(())
    }

    /// Fill in missing optional values
    pub fn apply_defaults(&mut self) {
        if self.log.level.is_empty() {
            self.log.level = "info".to_string();
        }
        if self.listen.socks.is_empty() {
            self.listen.socks = DEFAULT_SOCKS_LISTEN.to_string();
        }
        if self.resolvers.is_empty() {
            self.resolvers.push(DEFAULT_RESOLVER.to_string());
        }

        for t in &mut self.tunnels {
            if t.enabled.is_none() {
                t.enabled = Some(true);
            }
            if t.backend == BackendKind::Shadowsocks {
                if let Some(ss) = &mut t.shadowsocks {
                    if ss.method.is_empty() {
                        ss.method = "aes-256-gcm".to_string();
                    }
                }
            }
        }

        if self.route.active.is_empty() {
            if let Some(first) = self.tunnels.iter().find(|t| t.is_enabled()) {
                self.route.active = first.tag.clone();
            }
        }
    }

    /// Check the configuration for errors
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for (i, t) in self.tunnels.iter().enumerate() {
            if t.tag.is_empty() {
                return Err(Error::Config(format!("tunnels[{i}]: tag is required")));
            }
            if !is_valid_tag(&t.tag) {
                return Err(Error::Config(format!(
                    "tunnel '{}': tag must be 3-63 characters, start with a lowercase letter, \
                     and contain only lowercase letters, numbers, and hyphens",
                    t.tag
                )));
            }
            if !seen.insert(t.tag.as_str()) {
                return Err(Error::Config(format!("duplicate tunnel tag: {}", t.tag)));
            }

            if t.domain.is_empty() {
                return Err(Error::Config(format!("tunnel '{}': domain is required", t.tag)));
            }

            if let Some(resolver) = &t.resolver {
                warren_dns::Upstream::parse(resolver)
                    .map_err(|e| Error::Config(format!("tunnel '{}': {e}", t.tag)))?;
            }

            let transport = crate::transport::get(t.transport)?;
            if !transport.supported_backends().contains(&t.backend) {
                return Err(Error::Config(format!(
                    "tunnel '{}': transport {} does not support backend {}",
                    t.tag, t.transport, t.backend
                )));
            }
            transport
                .validate(t)
                .map_err(|e| Error::Config(format!("tunnel '{}': {e}", t.tag)))?;

            if t.backend == BackendKind::Ssh {
                let ssh = t.ssh.as_ref().ok_or_else(|| {
                    Error::Config(format!("tunnel '{}': ssh config is required", t.tag))
                })?;
                if ssh.user.is_empty() {
                    return Err(Error::Config(format!("tunnel '{}': ssh.user is required", t.tag)));
                }
            }

            if t.backend == BackendKind::Shadowsocks {
                let ss = t.shadowsocks.as_ref().ok_or_else(|| {
                    Error::Config(format!("tunnel '{}': shadowsocks config is required", t.tag))
                })?;
                validate_shadowsocks(&t.tag, ss)?;
            }
        }

        if !self.route.active.is_empty() && self.tunnel(&self.route.active).is_none() {
            return Err(Error::Config(format!(
                "route.active: tunnel '{}' does not exist",
                self.route.active
            )));
        }

        Ok(())
    }

    /// Look up a tunnel by tag
    pub fn tunnel(&self, tag: &str) -> Option<&TunnelSpec> {
        self.tunnels.iter().find(|t| t.tag == tag)
    }

    /// Resolver for a tunnel, ignoring the DNS proxy: per-tunnel override,
    /// else first configured, else the well-known fallback
    pub fn fallback_resolver(&self, spec: &TunnelSpec) -> String {
        if let Some(r) = &spec.resolver {
            if !r.is_empty() {
                return r.clone();
            }
        }
        self.resolvers
            .first()
            .cloned()
            .unwrap_or_else(|| DEFAULT_RESOLVER.to_string())
    }
}

fn validate_shadowsocks(tag: &str, ss: &ShadowsocksBlock) -> Result<()> {
    if ss.server.is_empty() {
        return Err(Error::Config(format!("tunnel '{tag}': shadowsocks.server is required")));
    }
    if !ss.server.contains(':') {
        return Err(Error::Config(format!(
            "tunnel '{tag}': invalid shadowsocks server, expected host:port"
        )));
    }
    if ss.password.is_empty() {
        return Err(Error::Config(format!("tunnel '{tag}': shadowsocks.password is required")));
    }
    const METHODS: [&str; 3] = ["aes-256-gcm", "aes-128-gcm", "chacha20-ietf-poly1305"];
    if !ss.method.is_empty() && !METHODS.contains(&ss.method.as_str()) {
        return Err(Error::Config(format!(
            "tunnel '{tag}': invalid shadowsocks method '{}', must be one of: {}",
            ss.method,
            METHODS.join(", ")
        )));
    }
    Ok(())
}

/// Tag grammar: `^[a-z][a-z0-9]*(-[a-z0-9]+)*$`, 3-63 characters
pub fn is_valid_tag(tag: &str) -> bool {
    if tag.len() < 3 || tag.len() > 63 {
        return false;
    }
    let bytes = tag.as_bytes();
    if !bytes[0].is_ascii_lowercase() {
        return false;
    }
    let mut prev_hyphen = false;
    for &b in &bytes[1..] {
        match b {
            b'a'..=b'z' | b'0'..=b'9' => prev_hyphen = false,
            b'-' if !prev_hyphen => prev_hyphen = true,
            _ => return false,
        }
    }
    !prev_hyphen
}

/// Lowercase a tag and replace underscores and spaces with hyphens
pub fn normalize_tag(tag: &str) -> String {
    tag.to_lowercase().replace(['_', ' '], "-")
}

/// Well-known file locations under the warren config directory
#[derive(Debug, Clone)]
pub struct Paths {
    dir: PathBuf,
}

impl Paths {
    /// Platform config directory: `$XDG_CONFIG_HOME/warren` or `~/.config/warren`
    pub fn default_dirs() -> Self {
        let base = std::env::var("XDG_CONFIG_HOME")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            dir: base.join("warren"),
        }
    }

    /// Root everything under an explicit directory
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join("config.json")
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join("state.json")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.dir.join("warren.sock")
    }

    pub fn daemon_log_path(&self) -> PathBuf {
        self.dir.join("daemon.log")
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.dir.join("bin")
    }

    /// Create the config directory with 0750 permissions
    pub fn ensure(&self) -> Result<()> {
        create_private_dir(&self.dir)
    }
}

pub(crate) fn create_private_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o750))?;
    }
    Ok(())
}

pub(crate) fn restrict_file_mode(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o640))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
