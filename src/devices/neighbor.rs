//! Kernel neighbor table monitor
//!
//! Client stations joining or leaving the access point show up as neighbor
//! cache transitions on the RTNLGRP_NEIGH multicast group. The monitor
//! decodes RTM_NEWNEIGH/RTM_DELNEIGH messages into [`NeighborEvent`]s and
//! can ask the kernel to re-verify a stale entry with a NUD_PROBE update.
//!
//! Wire constants follow linux/neighbour.h and linux/rtnetlink.h.

use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::sys::socket::{
    bind, socket, AddressFamily, NetlinkAddr, SockFlag, SockProtocol, SockType,
};

use crate::error::Result;

const NLMSG_HDRLEN: usize = 16;
const NDMSG_LEN: usize = 12;
const RTA_HDRLEN: usize = 4;

const NLMSG_DONE: u16 = 3;
const RTM_NEWNEIGH: u16 = 28;
const RTM_DELNEIGH: u16 = 29;

const NDA_DST: u16 = 1;
const NDA_LLADDR: u16 = 2;

const NUD_REACHABLE: u16 = 0x02;
const NUD_STALE: u16 = 0x04;
const NUD_PROBE: u16 = 0x10;
const NUD_FAILED: u16 = 0x20;

const RTMGRP_NEIGH: u32 = 0x4;

const RECV_BUFFER_SIZE: usize = 512;

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Neighbor cache states the daemon reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborState {
    Reachable,
    Stale,
    Failed,
}

impl NeighborState {
    fn from_nud(state: u16) -> Option<Self> {
        match state {
            NUD_REACHABLE => Some(Self::Reachable),
            NUD_STALE => Some(Self::Stale),
            NUD_FAILED => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One decoded neighbor table transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEvent {
    pub ifindex: i32,
    pub state: NeighborState,
    pub ip: Ipv4Addr,
    pub mac: Option<[u8; 6]>,
}

/// Seam between the wifi subsystem and the kernel neighbor table.
pub trait NeighborMonitor {
    /// Drain the events currently queued on the monitor.
    fn poll_events(&mut self) -> Result<Vec<NeighborEvent>>;
    /// Ask the kernel to re-verify the entry behind a stale event.
    fn probe(&mut self, event: &NeighborEvent) -> Result<()>;
}

/// Real monitor backed by two NETLINK_ROUTE sockets, one subscribed to the
/// neighbor multicast group and one for probe requests.
pub struct RtnetlinkMonitor {
    recv_fd: OwnedFd,
    send_fd: OwnedFd,
}

impl RtnetlinkMonitor {
    pub fn new() -> Result<Self> {
        let recv_fd = socket(
            AddressFamily::Netlink,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkRoute,
        )?;
        bind(recv_fd.as_raw_fd(), &NetlinkAddr::new(0, RTMGRP_NEIGH))?;

        let send_fd = socket(
            AddressFamily::Netlink,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkRoute,
        )?;
        Ok(Self { recv_fd, send_fd })
    }
}

impl AsRawFd for RtnetlinkMonitor {
    fn as_raw_fd(&self) -> RawFd {
        self.recv_fd.as_raw_fd()
    }
}

impl NeighborMonitor for RtnetlinkMonitor {
    fn poll_events(&mut self) -> Result<Vec<NeighborEvent>> {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let len = nix::sys::socket::recv(
            self.recv_fd.as_raw_fd(),
            &mut buf,
            nix::sys::socket::MsgFlags::empty(),
        )?;
        Ok(parse_neighbor_messages(&buf[..len]))
    }

    fn probe(&mut self, event: &NeighborEvent) -> Result<()> {
        let request = build_probe_request(event);
        let kernel = NetlinkAddr::new(0, 0);
        nix::sys::socket::sendto(
            self.send_fd.as_raw_fd(),
            &request,
            &kernel,
            nix::sys::socket::MsgFlags::empty(),
        )?;
        Ok(())
    }
}

/// Decode every neighbor message in one receive buffer. Messages for other
/// address families or uninteresting NUD states are skipped.
pub fn parse_neighbor_messages(buf: &[u8]) -> Vec<NeighborEvent> {
    let mut events = Vec::new();
    let mut offset = 0;

    while offset + NLMSG_HDRLEN <= buf.len() {
        let msg_len =
            u32::from_ne_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
                as usize;
        let msg_type = u16::from_ne_bytes([buf[offset + 4], buf[offset + 5]]);
        if msg_len < NLMSG_HDRLEN || offset + msg_len > buf.len() {
            break;
        }
        if msg_type == NLMSG_DONE {
            break;
        }
        if msg_type == RTM_NEWNEIGH || msg_type == RTM_DELNEIGH {
            if let Some(event) = parse_one(&buf[offset + NLMSG_HDRLEN..offset + msg_len]) {
                events.push(event);
            }
        }
        offset += align4(msg_len);
    }
    events
}

fn parse_one(body: &[u8]) -> Option<NeighborEvent> {
    if body.len() < NDMSG_LEN {
        return None;
    }
    let family = body[0];
    if family != libc::AF_INET as u8 {
        return None;
    }
    let ifindex = i32::from_ne_bytes([body[4], body[5], body[6], body[7]]);
    let nud_state = u16::from_ne_bytes([body[8], body[9]]);
    let state = NeighborState::from_nud(nud_state)?;

    let mut ip = None;
    let mut mac = None;
    let mut offset = NDMSG_LEN;
    while offset + RTA_HDRLEN <= body.len() {
        let rta_len = u16::from_ne_bytes([body[offset], body[offset + 1]]) as usize;
        let rta_type = u16::from_ne_bytes([body[offset + 2], body[offset + 3]]);
        if rta_len < RTA_HDRLEN || offset + rta_len > body.len() {
            break;
        }
        let payload = &body[offset + RTA_HDRLEN..offset + rta_len];
        match rta_type {
            NDA_DST if payload.len() == 4 => {
                ip = Some(Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]));
            }
            NDA_LLADDR if payload.len() == 6 => {
                let mut addr = [0u8; 6];
                addr.copy_from_slice(payload);
                mac = Some(addr);
            }
            _ => {}
        }
        offset += align4(rta_len);
    }

    Some(NeighborEvent {
        ifindex,
        state,
        ip: ip?,
        mac,
    })
}

/// Build the RTM_NEWNEIGH request that flips an entry to NUD_PROBE.
pub fn build_probe_request(event: &NeighborEvent) -> Vec<u8> {
    let mut attrs = Vec::new();
    push_attr(&mut attrs, NDA_DST, &event.ip.octets());
    if let Some(mac) = &event.mac {
        push_attr(&mut attrs, NDA_LLADDR, mac);
    }

    let total = NLMSG_HDRLEN + NDMSG_LEN + attrs.len();
    let mut msg = Vec::with_capacity(total);
    // nlmsghdr
    msg.extend_from_slice(&(total as u32).to_ne_bytes());
    msg.extend_from_slice(&RTM_NEWNEIGH.to_ne_bytes());
    msg.extend_from_slice(
        &((libc::NLM_F_REQUEST | libc::NLM_F_REPLACE) as u16).to_ne_bytes(),
    );
    msg.extend_from_slice(&0u32.to_ne_bytes()); // seq
    msg.extend_from_slice(&0u32.to_ne_bytes()); // pid
    // ndmsg
    msg.push(libc::AF_INET as u8);
    msg.extend_from_slice(&[0u8; 3]); // padding
    msg.extend_from_slice(&event.ifindex.to_ne_bytes());
    msg.extend_from_slice(&NUD_PROBE.to_ne_bytes());
    msg.push(0); // ndm_flags
    msg.push(0); // ndm_type
    msg.extend_from_slice(&attrs);
    msg
}

fn push_attr(out: &mut Vec<u8>, rta_type: u16, payload: &[u8]) {
    let rta_len = RTA_HDRLEN + payload.len();
    out.extend_from_slice(&(rta_len as u16).to_ne_bytes());
    out.extend_from_slice(&rta_type.to_ne_bytes());
    out.extend_from_slice(payload);
    out.resize(out.len() + (align4(rta_len) - rta_len), 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neigh_message(msg_type: u16, nud_state: u16, ip: [u8; 4], mac: Option<[u8; 6]>) -> Vec<u8> {
        let mut attrs = Vec::new();
        push_attr(&mut attrs, NDA_DST, &ip);
        if let Some(mac) = mac {
            push_attr(&mut attrs, NDA_LLADDR, &mac);
        }
        let total = NLMSG_HDRLEN + NDMSG_LEN + attrs.len();
        let mut msg = Vec::new();
        msg.extend_from_slice(&(total as u32).to_ne_bytes());
        msg.extend_from_slice(&msg_type.to_ne_bytes());
        msg.extend_from_slice(&0u16.to_ne_bytes());
        msg.extend_from_slice(&1u32.to_ne_bytes());
        msg.extend_from_slice(&0u32.to_ne_bytes());
        msg.push(libc::AF_INET as u8);
        msg.extend_from_slice(&[0u8; 3]);
        msg.extend_from_slice(&3i32.to_ne_bytes());
        msg.extend_from_slice(&nud_state.to_ne_bytes());
        msg.push(0);
        msg.push(0);
        msg.extend_from_slice(&attrs);
        msg
    }

    #[test]
    fn test_parses_reachable_neighbor() {
        let buf = neigh_message(
            RTM_NEWNEIGH,
            NUD_REACHABLE,
            [192, 168, 43, 2],
            Some([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
        );
        let events = parse_neighbor_messages(&buf);
        assert_eq!(
            events,
            vec![NeighborEvent {
                ifindex: 3,
                state: NeighborState::Reachable,
                ip: Ipv4Addr::new(192, 168, 43, 2),
                mac: Some([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
            }]
        );
    }

    #[test]
    fn test_parses_multiple_messages_in_one_buffer() {
        let mut buf = neigh_message(RTM_NEWNEIGH, NUD_STALE, [192, 168, 43, 5], None);
        buf.extend(neigh_message(RTM_DELNEIGH, NUD_FAILED, [192, 168, 43, 6], None));
        let events = parse_neighbor_messages(&buf);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].state, NeighborState::Stale);
        assert_eq!(events[1].state, NeighborState::Failed);
    }

    #[test]
    fn test_ignores_uninteresting_nud_states() {
        // NUD_PERMANENT
        let buf = neigh_message(RTM_NEWNEIGH, 0x80, [192, 168, 43, 2], None);
        assert!(parse_neighbor_messages(&buf).is_empty());
    }

    #[test]
    fn test_ignores_non_ipv4_family() {
        let mut buf = neigh_message(RTM_NEWNEIGH, NUD_REACHABLE, [192, 168, 43, 2], None);
        buf[NLMSG_HDRLEN] = libc::AF_INET6 as u8;
        assert!(parse_neighbor_messages(&buf).is_empty());
    }

    #[test]
    fn test_truncated_buffer_does_not_panic() {
        let buf = neigh_message(RTM_NEWNEIGH, NUD_REACHABLE, [192, 168, 43, 2], None);
        for cut in 0..buf.len() {
            let _ = parse_neighbor_messages(&buf[..cut]);
        }
    }

    #[test]
    fn test_probe_request_shape() {
        let event = NeighborEvent {
            ifindex: 4,
            state: NeighborState::Stale,
            ip: Ipv4Addr::new(192, 168, 43, 9),
            mac: Some([1, 2, 3, 4, 5, 6]),
        };
        let req = build_probe_request(&event);
        let len = u32::from_ne_bytes([req[0], req[1], req[2], req[3]]) as usize;
        assert_eq!(len, req.len());
        assert_eq!(u16::from_ne_bytes([req[4], req[5]]), RTM_NEWNEIGH);
        // ndm_state is NUD_PROBE
        let state = u16::from_ne_bytes([req[NLMSG_HDRLEN + 8], req[NLMSG_HDRLEN + 9]]);
        assert_eq!(state, NUD_PROBE);
    }
}
