//! Unix datagram endpoints
//!
//! The router and the RC service are reached over SOCK_DGRAM unix sockets.
//! Router-facing names live in the abstract namespace; the RC service uses
//! a filesystem path. A send that writes fewer bytes than the frame is a
//! failure, never a partial delivery.

use std::os::fd::{AsRawFd, RawFd};
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixDatagram};
use std::path::Path;

use crate::error::{ControlError, Result};

/// A non-blocking unix datagram socket with whole-frame send semantics.
pub struct Endpoint {
    socket: UnixDatagram,
}

impl Endpoint {
    /// Bind to a name in the abstract namespace so peers can address us.
    pub fn bind_abstract(name: &str) -> Result<Self> {
        let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
        let socket = UnixDatagram::bind_addr(&addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }

    /// An unbound socket, for send-only links.
    pub fn unbound() -> Result<Self> {
        let socket = UnixDatagram::unbound()?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }

    pub fn send_abstract(&self, name: &str, frame: &[u8]) -> Result<()> {
        let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
        self.send_addr(&addr, frame)
    }

    pub fn send_path(&self, path: &Path, frame: &[u8]) -> Result<()> {
        let written = self.socket.send_to(frame, path).map_err(|e| {
            ControlError::Endpoint(format!("send to {}: {e}", path.display()))
        })?;
        if written != frame.len() {
            return Err(ControlError::PartialSend {
                written,
                len: frame.len(),
            });
        }
        Ok(())
    }

    fn send_addr(&self, addr: &SocketAddr, frame: &[u8]) -> Result<()> {
        let written = self.socket.send_to_addr(frame, addr)?;
        if written != frame.len() {
            return Err(ControlError::PartialSend {
                written,
                len: frame.len(),
            });
        }
        Ok(())
    }

    pub fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.socket.recv(buf)
    }

    pub fn socket(&self) -> &UnixDatagram {
        &self.socket
    }
}

impl AsRawFd for Endpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("{}-{}-{}", tag, std::process::id(), rand_suffix())
    }

    fn rand_suffix() -> u128 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0)
    }

    #[test]
    fn test_abstract_send_and_receive() {
        let name = unique_name("endpoint-test");
        let server = Endpoint::bind_abstract(&name).unwrap();
        let client = Endpoint::unbound().unwrap();
        client.send_abstract(&name, b"frame").unwrap();

        std::thread::sleep(std::time::Duration::from_millis(10));
        let mut buf = [0u8; 64];
        let len = server.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"frame");
    }

    #[test]
    fn test_path_send_delivers_whole_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rc.sock");
        let server = UnixDatagram::bind(&path).unwrap();
        let client = Endpoint::unbound().unwrap();
        client.send_path(&path, &[0x5A, 0x3C]).unwrap();

        let mut buf = [0u8; 16];
        let len = server.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], &[0x5A, 0x3C]);
    }

    #[test]
    fn test_send_to_absent_peer_fails() {
        let client = Endpoint::unbound().unwrap();
        let name = unique_name("endpoint-nobody");
        assert!(client.send_abstract(&name, b"frame").is_err());
    }

    #[test]
    fn test_bind_is_exclusive() {
        let name = unique_name("endpoint-dup");
        let _first = Endpoint::bind_abstract(&name).unwrap();
        assert!(Endpoint::bind_abstract(&name).is_err());
    }
}
