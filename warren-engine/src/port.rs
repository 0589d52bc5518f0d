//! Local port allocation
//!
//! All probes bind loopback test listeners and release them immediately.
//! There is an unavoidable race between allocation and the eventual bind
//! by the consumer; callers handle downstream bind failures.

use std::net::{TcpListener, UdpSocket};

use crate::error::{Error, Result};

/// Lower bound of the dual-port scan range
pub const MIN_PORT: u16 = 10000;

/// Upper bound of the dual-port scan range
pub const MAX_PORT: u16 = 60000;

/// Whether a TCP listener can currently be bound on the loopback port
pub fn is_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Allocate an ephemeral TCP port via an OS-assigned bind
pub fn any_tcp() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .map_err(|e| Error::Transient(format!("failed to find available port: {e}")))?;
    let port = listener.local_addr()?.port();
    Ok(port)
}

/// Allocate a port free on both TCP and UDP (DNS listeners need both).
///
/// Asks the OS for an ephemeral TCP port and verifies UDP on the same
/// number; in the rare case UDP is taken, scans a bounded range instead.
pub fn any_dual() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .map_err(|e| Error::Transient(format!("failed to find available port: {e}")))?;
    let port = listener.local_addr()?.port();
    drop(listener);

    if UdpSocket::bind(("127.0.0.1", port)).is_ok() {
        return Ok(port);
    }

    any_dual_in_range(MIN_PORT, MAX_PORT)
}

fn any_dual_in_range(min: u16, max: u16) -> Result<u16> {
    for port in min..=max {
        let Ok(tcp) = TcpListener::bind(("127.0.0.1", port)) else {
            continue;
        };
        if UdpSocket::bind(("127.0.0.1", port)).is_ok() {
            drop(tcp);
            return Ok(port);
        }
    }
    Err(Error::Transient(format!(
        "no dual-stack port found in range {min}-{max}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_any_tcp_is_bindable() {
        let port = any_tcp().unwrap();
        assert!(port > 0);
        assert!(TcpListener::bind(("127.0.0.1", port)).is_ok());
    }

    #[test]
    fn test_is_available_reflects_bound_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_available(port));
        drop(listener);
        assert!(is_available(port));
    }

    #[test]
    fn test_any_dual_free_on_both() {
        let port = any_dual().unwrap();
        assert!(TcpListener::bind(("127.0.0.1", port)).is_ok());
        assert!(UdpSocket::bind(("127.0.0.1", port)).is_ok());
    }

    #[test]
    fn test_dual_range_scan_skips_taken_udp() {
        // Occupy UDP on a port, leaving TCP free, and scan a range that
        // starts there: the scan must move past it.
        let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        let taken = udp.local_addr().unwrap().port();
        if taken >= MAX_PORT {
            return;
        }
        let found = any_dual_in_range(taken, MAX_PORT).unwrap();
        assert_ne!(found, taken);
    }
}
