//! Router controller command protocol
//!
//! Endpoint management commands travel as ASCII datagrams of the form
//! `COMMAND:ARGUMENT` to the router controller's abstract socket, which
//! answers `COMMAND:OK` or `COMMAND:FAIL`. The reply is matched by the
//! prefix before the colon; datagrams for some other command are discarded
//! and the wait continues until the [`ACK_WAIT`] budget runs out.

use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixDatagram};

use crate::core::{RetryPolicy, ACK_WAIT};
use crate::error::{ControlError, Result};

const ACK_BUFFER_SIZE: usize = 512;

/// Blocking requester for the router controller.
pub struct RouterClient {
    socket: UnixDatagram,
    controller: String,
    policy: RetryPolicy,
}

impl RouterClient {
    /// Bind `local_name` in the abstract namespace so the controller can
    /// address its replies.
    pub fn new(local_name: &str, controller_name: &str) -> Result<Self> {
        Self::with_policy(local_name, controller_name, ACK_WAIT)
    }

    pub fn with_policy(
        local_name: &str,
        controller_name: &str,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let addr = SocketAddr::from_abstract_name(local_name.as_bytes())?;
        let socket = UnixDatagram::bind_addr(&addr)?;
        socket.set_read_timeout(Some(policy.interval))?;
        Ok(Self {
            socket,
            controller: controller_name.to_string(),
            policy,
        })
    }

    /// Send one command and wait for its acknowledgement.
    ///
    /// Returns `Ok(true)` on `OK`, `Ok(false)` on `FAIL`, and an error if
    /// the controller never answered this command in time.
    pub fn request(&self, command: &str, argument: &str) -> Result<bool> {
        let request = format!("{command}:{argument}");
        let addr = SocketAddr::from_abstract_name(self.controller.as_bytes())?;
        let written = self.socket.send_to_addr(request.as_bytes(), &addr)?;
        if written != request.len() {
            return Err(ControlError::PartialSend {
                written,
                len: request.len(),
            });
        }
        log::info!("router request: {request}");

        let mut buf = [0u8; ACK_BUFFER_SIZE];
        for _ in 0..self.policy.max_attempts {
            let len = match self.socket.recv(&mut buf) {
                Ok(0) => continue,
                Ok(len) => len,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue
                }
                Err(e) => return Err(e.into()),
            };
            match parse_ack(&buf[..len], command) {
                Some(accepted) => {
                    log::info!("router ack for {command}: {accepted}");
                    return Ok(accepted);
                }
                // Reply for some other command, keep waiting.
                None => continue,
            }
        }
        Err(ControlError::Endpoint(format!(
            "no ack from router controller for {command}"
        )))
    }
}

/// Match `COMMAND:OK` / `COMMAND:FAIL` against the awaited command.
fn parse_ack(data: &[u8], command: &str) -> Option<bool> {
    let text = std::str::from_utf8(data).ok()?;
    let (cmd, status) = text.split_once(':')?;
    if cmd != command {
        return None;
    }
    Some(status == "OK")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(20),
            max_attempts: 5,
        }
    }

    fn unique(tag: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        format!("{tag}-{}-{nanos}", std::process::id())
    }

    fn spawn_controller(name: &str, replies: Vec<&'static [u8]>) -> std::thread::JoinHandle<()> {
        let addr = SocketAddr::from_abstract_name(name.as_bytes()).unwrap();
        let socket = UnixDatagram::bind_addr(&addr).unwrap();
        std::thread::spawn(move || {
            let mut buf = [0u8; 512];
            let (_, src) = socket.recv_from(&mut buf).unwrap();
            let peer = src.as_abstract_name().unwrap().to_vec();
            let dest = SocketAddr::from_abstract_name(&peer).unwrap();
            for reply in replies {
                socket.send_to_addr(reply, &dest).unwrap();
            }
        })
    }

    #[test]
    fn test_ok_ack_accepted() {
        let controller = unique("router-ok");
        let handle = spawn_controller(&controller, vec![b"ADD_ENDPOINT:OK"]);
        let client =
            RouterClient::with_policy(&unique("client-ok"), &controller, fast_policy()).unwrap();
        assert!(client.request("ADD_ENDPOINT", "192.168.43.2").unwrap());
        handle.join().unwrap();
    }

    #[test]
    fn test_fail_ack_rejected() {
        let controller = unique("router-fail");
        let handle = spawn_controller(&controller, vec![b"REMOVE_ENDPOINT:FAIL"]);
        let client =
            RouterClient::with_policy(&unique("client-fail"), &controller, fast_policy()).unwrap();
        assert!(!client.request("REMOVE_ENDPOINT", "192.168.43.2").unwrap());
        handle.join().unwrap();
    }

    #[test]
    fn test_mismatched_ack_is_discarded() {
        let controller = unique("router-mix");
        let handle = spawn_controller(
            &controller,
            vec![b"REMOVE_ENDPOINT:OK", b"ADD_ENDPOINT:OK"],
        );
        let client =
            RouterClient::with_policy(&unique("client-mix"), &controller, fast_policy()).unwrap();
        assert!(client.request("ADD_ENDPOINT", "192.168.43.7").unwrap());
        handle.join().unwrap();
    }

    #[test]
    fn test_silent_controller_times_out() {
        let controller = unique("router-mute");
        let addr = SocketAddr::from_abstract_name(controller.as_bytes()).unwrap();
        let _mute = UnixDatagram::bind_addr(&addr).unwrap();
        let client =
            RouterClient::with_policy(&unique("client-mute"), &controller, fast_policy()).unwrap();
        assert!(client.request("ADD_ENDPOINT", "192.168.43.9").is_err());
    }

    #[test]
    fn test_parse_ack_shapes() {
        assert_eq!(parse_ack(b"ADD_ENDPOINT:OK", "ADD_ENDPOINT"), Some(true));
        assert_eq!(parse_ack(b"ADD_ENDPOINT:FAIL", "ADD_ENDPOINT"), Some(false));
        assert_eq!(parse_ack(b"OTHER:OK", "ADD_ENDPOINT"), None);
        assert_eq!(parse_ack(b"no colon here", "ADD_ENDPOINT"), None);
        assert_eq!(parse_ack(&[0xFF, 0xFE], "ADD_ENDPOINT"), None);
    }
}
