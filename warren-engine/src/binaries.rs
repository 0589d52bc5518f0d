//! Binary resolution contract
//!
//! Transport child processes are external binaries installed by a
//! separate tool. The engine only needs to answer two questions: is a
//! binary installed, and where. The default resolver prefers the warren
//! bin directory and falls back to `$PATH`.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Slipstream client binary name
pub const BIN_SLIPSTREAM: &str = "slipstream-client";

/// DNSTT client binary name
pub const BIN_DNSTT: &str = "dnstt-client";

/// Shadowsocks local client binary name
pub const BIN_SSLOCAL: &str = "sslocal";

/// Resolves transport binary names to executable paths
pub trait BinaryResolver: Send + Sync {
    /// Absolute path of an installed binary
    fn resolve(&self, name: &str) -> Result<PathBuf>;

    /// Whether the binary is installed
    fn installed(&self, name: &str) -> bool {
        self.resolve(name).is_ok()
    }
}

/// Looks in a dedicated bin directory first, then `$PATH`
pub struct DirResolver {
    bin_dir: PathBuf,
}

impl DirResolver {
    pub fn new(bin_dir: impl Into<PathBuf>) -> Self {
        Self {
            bin_dir: bin_dir.into(),
        }
    }
}

impl BinaryResolver for DirResolver {
    fn resolve(&self, name: &str) -> Result<PathBuf> {
        let local = self.bin_dir.join(name);
        if is_executable(&local) {
            return Ok(local);
        }

        if let Some(paths) = std::env::var_os("PATH") {
            for dir in std::env::split_paths(&paths) {
                let candidate = dir.join(name);
                if is_executable(&candidate) {
                    return Ok(candidate);
                }
            }
        }

        Err(Error::Precondition(format!(
            "binary {name} not installed — run install first"
        )))
    }
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn install_fake(dir: &Path, name: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    #[cfg(unix)]
    fn test_resolves_from_bin_dir() {
        let dir = tempfile::tempdir().unwrap();
        let expected = install_fake(dir.path(), BIN_SLIPSTREAM);

        let resolver = DirResolver::new(dir.path());
        assert!(resolver.installed(BIN_SLIPSTREAM));
        assert_eq!(resolver.resolve(BIN_SLIPSTREAM).unwrap(), expected);
    }

    #[test]
    #[cfg(unix)]
    fn test_non_executable_file_is_not_installed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(BIN_DNSTT), "data").unwrap();

        let resolver = DirResolver::new(dir.path());
        assert!(!resolver.installed(BIN_DNSTT));
    }

    #[test]
    fn test_missing_binary_message_is_actionable() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = DirResolver::new(dir.path());
        let err = resolver.resolve("definitely-not-a-real-binary").unwrap_err();
        assert!(err.to_string().contains("run install first"));
    }
}
