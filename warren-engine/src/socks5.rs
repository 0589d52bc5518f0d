//! SOCKS5 server-side handshake (CONNECT subset)
//!
//! Only what the SSH adapter needs: no-auth negotiation, CONNECT with
//! IPv4 / domain / IPv6 targets, and fixed 0.0.0.0:0 bind replies.
//! Blocking I/O; the adapter runs on plain threads.

use std::io::{self, Read, Write};
use std::net::TcpStream;

pub const VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Reply codes used by the adapter
pub const REP_SUCCESS: u8 = 0x00;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Run the inbound handshake and return the requested (host, port).
///
/// Protocol violations get the appropriate failure reply before the
/// error is returned; the caller just drops the connection.
pub fn handshake(stream: &mut TcpStream) -> io::Result<(String, u16)> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head)?;
    if head[0] != VERSION {
        return Err(bad_data(format!("unsupported SOCKS version: {}", head[0])));
    }

    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods)?;
    stream.write_all(&[VERSION, METHOD_NO_AUTH])?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request)?;
    if request[0] != VERSION {
        return Err(bad_data(format!("invalid request version: {}", request[0])));
    }
    if request[1] != CMD_CONNECT {
        reply(stream, REP_COMMAND_NOT_SUPPORTED)?;
        return Err(bad_data(format!("unsupported command: {}", request[1])));
    }

    let host = match request[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr)?;
            std::net::Ipv4Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len)?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name)?;
            String::from_utf8_lossy(&name).into_owned()
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr)?;
            std::net::Ipv6Addr::from(addr).to_string()
        }
        other => {
            reply(stream, REP_ADDRESS_NOT_SUPPORTED)?;
            return Err(bad_data(format!("unsupported address type: {other}")));
        }
    };

    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf)?;
    let port = u16::from_be_bytes(port_buf);

    Ok((host, port))
}

/// Send a reply with BND.ADDR 0.0.0.0 and BND.PORT 0
pub fn reply(stream: &mut TcpStream, code: u8) -> io::Result<()> {
    stream.write_all(&[VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
}

fn bad_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    /// Drive the handshake against raw client bytes; returns the parsed
    /// target and everything the server wrote back.
    fn run(client_bytes: &[u8]) -> (io::Result<(String, u16)>, Vec<u8>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let bytes = client_bytes.to_vec();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(&bytes).unwrap();
            let mut reply = Vec::new();
            let _ = stream.read_to_end(&mut reply);
            reply
        });

        let (mut server, _) = listener.accept().unwrap();
        let result = handshake(&mut server);
        drop(server);
        let reply = client.join().unwrap();
        (result, reply)
    }

    #[test]
    fn test_ipv4_connect() {
        let (result, reply) = run(&[
            0x05, 0x01, 0x00, // greeting, one method, no-auth
            0x05, 0x01, 0x00, 0x01, // CONNECT, IPv4
            10, 0, 0, 7, // 10.0.0.7
            0x1F, 0x90, // port 8080
        ]);
        assert_eq!(result.unwrap(), ("10.0.0.7".to_string(), 8080));
        assert_eq!(&reply[..2], &[0x05, 0x00]);
    }

    #[test]
    fn test_domain_connect() {
        let mut bytes = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x03];
        bytes.push(11);
        bytes.extend_from_slice(b"example.com");
        bytes.extend_from_slice(&443u16.to_be_bytes());

        let (result, _) = run(&bytes);
        assert_eq!(result.unwrap(), ("example.com".to_string(), 443));
    }

    #[test]
    fn test_ipv6_connect() {
        let mut bytes = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x04];
        bytes.extend_from_slice(&std::net::Ipv6Addr::LOCALHOST.octets());
        bytes.extend_from_slice(&53u16.to_be_bytes());

        let (result, _) = run(&bytes);
        assert_eq!(result.unwrap(), ("::1".to_string(), 53));
    }

    #[test]
    fn test_unsupported_command_replies_0x07() {
        let (result, reply) = run(&[
            0x05, 0x01, 0x00, //
            0x05, 0x02, 0x00, 0x01, // BIND
            0, 0, 0, 0, 0, 0,
        ]);
        assert!(result.is_err());
        // method selection, then the failure reply
        assert_eq!(&reply[..2], &[0x05, 0x00]);
        assert_eq!(reply[3], REP_COMMAND_NOT_SUPPORTED);
    }

    #[test]
    fn test_unsupported_atyp_replies_0x08() {
        let (result, reply) = run(&[
            0x05, 0x01, 0x00, //
            0x05, 0x01, 0x00, 0x09, // bogus ATYP
        ]);
        assert!(result.is_err());
        assert_eq!(reply[3], REP_ADDRESS_NOT_SUPPORTED);
    }

    #[test]
    fn test_wrong_version_rejected() {
        let (result, _) = run(&[0x04, 0x01, 0x00]);
        assert!(result.is_err());
    }
}
