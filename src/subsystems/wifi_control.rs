//! WiFi client tracking
//!
//! Watches the kernel neighbor table for stations joining and leaving the
//! local access point, and keeps the router's endpoint list in sync: a
//! reachable station becomes a telemetry endpoint, a failed one is removed.
//! Stale entries are re-probed so the kernel resolves them to one of the
//! two definite states instead of letting them linger.
//!
//! Everything is gated on the host actually being in access-point mode;
//! neighbor churn on a client network is none of our business.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::communication::RouterClient;
use crate::config::Config;
use crate::core::{EventHandler, Reactor, StopHandle, Token};
use crate::devices::{NeighborEvent, NeighborMonitor, NeighborState, RtnetlinkMonitor};
use crate::error::Result;

const SOCKET_NAME: &str = "wificontrol";
const AP_INTERFACE: &str = "wlan0";
const ADD_ENDPOINT: &str = "ADD_ENDPOINT";
const REMOVE_ENDPOINT: &str = "REMOVE_ENDPOINT";

/// Seam toward the router's endpoint list.
pub trait EndpointRegistrar {
    fn add_endpoint(&mut self, ip: &str) -> bool;
    fn remove_endpoint(&mut self, ip: &str) -> bool;
}

impl EndpointRegistrar for RouterClient {
    fn add_endpoint(&mut self, ip: &str) -> bool {
        self.request(ADD_ENDPOINT, ip).unwrap_or_else(|e| {
            log::warn!("add endpoint {ip} failed: {e}");
            false
        })
    }

    fn remove_endpoint(&mut self, ip: &str) -> bool {
        self.request(REMOVE_ENDPOINT, ip).unwrap_or_else(|e| {
            log::warn!("remove endpoint {ip} failed: {e}");
            false
        })
    }
}

/// Reconciles neighbor events against the set of registered endpoints.
pub struct WifiLogic {
    prefix: String,
    tracked: Vec<Ipv4Addr>,
}

impl WifiLogic {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            tracked: Vec::new(),
        }
    }

    /// Feed one event through the reconciliation rules. Returns true when
    /// the entry should be probed so the kernel settles its state.
    ///
    /// Registration tracking follows the acks: an endpoint only counts as
    /// added or removed once the router confirmed it, so a refused request
    /// is retried the next time the station shows up in the same state.
    pub fn handle_event(
        &mut self,
        event: &NeighborEvent,
        registrar: &mut dyn EndpointRegistrar,
    ) -> bool {
        let ip = event.ip.to_string();
        if !ip.starts_with(&self.prefix) {
            log::debug!("neighbor {ip} outside the AP subnet, ignoring");
            return false;
        }
        let tracked = self.tracked.contains(&event.ip);
        match event.state {
            NeighborState::Reachable => {
                if !tracked && registrar.add_endpoint(&ip) {
                    log::info!("station {ip} registered");
                    self.tracked.push(event.ip);
                }
                false
            }
            NeighborState::Stale => !tracked,
            NeighborState::Failed => {
                if tracked && registrar.remove_endpoint(&ip) {
                    log::info!("station {ip} deregistered");
                    self.tracked.retain(|t| *t != event.ip);
                }
                false
            }
        }
    }
}

/// The host is the AP iff `wlan0` carries the configured AP address.
fn ap_mode_active(ap_ip: &str) -> bool {
    let addrs = match nix::ifaddrs::getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            log::warn!("failed to enumerate interfaces: {e}");
            return false;
        }
    };
    for ifaddr in addrs {
        if ifaddr.interface_name != AP_INTERFACE {
            continue;
        }
        let Some(addr) = ifaddr.address else { continue };
        if let Some(sin) = addr.as_sockaddr_in() {
            if sin.ip().to_string() == ap_ip {
                return true;
            }
        }
    }
    false
}

/// Reactor-driven side of the subsystem.
pub struct WifiControl {
    config: Arc<Config>,
    monitor: RtnetlinkMonitor,
    router: RouterClient,
    logic: WifiLogic,
    monitor_token: Token,
}

impl WifiControl {
    pub fn spawn(config: Arc<Config>) -> Result<(StopHandle, JoinHandle<()>)> {
        let mut reactor = Reactor::new()?;
        let monitor = RtnetlinkMonitor::new()?;
        let monitor_token = reactor.register_raw(&monitor)?;

        let mut task = Self {
            router: RouterClient::new(SOCKET_NAME, &config.router_controller_name)?,
            logic: WifiLogic::new(&config.wifi_ip_address_prefix),
            config,
            monitor,
            monitor_token,
        };
        let stop = reactor.stop_handle();
        let handle = std::thread::Builder::new()
            .name("wifi-control".to_string())
            .spawn(move || {
                if let Err(e) = reactor.run(&mut task) {
                    log::error!("wifi control loop failed: {e}");
                }
            })?;
        Ok((stop, handle))
    }
}

impl EventHandler for WifiControl {
    fn on_readable(&mut self, token: Token) -> Result<()> {
        debug_assert_eq!(token, self.monitor_token);
        // Always drained, so the socket does not back up while the host is
        // not acting as the AP.
        let events = self.monitor.poll_events()?;
        if !ap_mode_active(&self.config.wifi_ap_ip_address) {
            log::debug!("not in AP mode, discarding {} neighbor events", events.len());
            return Ok(());
        }
        for event in events {
            if self.logic.handle_event(&event, &mut self.router) {
                self.monitor.probe(&event)?;
            }
        }
        Ok(())
    }
}
