//! Daemon configuration
//!
//! Loads configuration from a TOML file. The parsed [`Config`] is immutable
//! after startup and shared across subsystem threads as `Arc<Config>`; no
//! subsystem ever mutates it.
//!
//! Defaults mirror a companion board wired to a local MAVLink router: all
//! subsystems disabled until the deployment enables them explicitly.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{ControlError, Result};

/// Which D2D metric drives bitrate adaptation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitrateMetric {
    /// Adapt on the granted uplink bandwidth.
    Throughput,
    /// Adapt on the signal-to-noise ratio.
    SignalNoise,
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// MAVLink identity of the board-control subsystem.
    pub board_system_id: u8,
    pub board_component_id: u8,
    /// MAVLink identity of the camera subsystem.
    pub camera_system_id: u8,
    pub camera_component_id: u8,

    /// Abstract endpoint the router listens on for board frames.
    pub board_endpoint_name: String,
    /// Abstract endpoint the router listens on for camera frames.
    pub camera_endpoint_name: String,
    /// Abstract endpoint of the router's control channel (ADD/REMOVE_ENDPOINT).
    pub router_controller_name: String,
    /// Filesystem path of the RC bridge datagram socket.
    pub rc_socket_path: PathBuf,

    /// Address advertised in the RTSP stream URI.
    pub video_stream_ip_address: String,
    /// File the camera subsystem writes the chosen preview resolution to, for
    /// the downstream video streamer.
    pub stream_hint_path: PathBuf,

    /// Local address the host carries when acting as WiFi access point.
    pub wifi_ap_ip_address: String,
    /// Only client addresses under this prefix are tracked.
    pub wifi_ip_address_prefix: String,

    pub support_multiple_camera: bool,
    pub support_camera_capture: bool,

    /// Sysfs attribute carrying the board temperature ADC reading.
    pub board_temperature_path: PathBuf,

    /// Airborne unit: emits telemetry and time-sync requests. Ground unit:
    /// answers time-sync requests instead.
    pub in_air: bool,

    pub bitrate_adjust_metric: BitrateMetric,

    pub board_control_enabled: bool,
    pub camera_control_enabled: bool,
    pub wifi_control_enabled: bool,
    pub d2d_tracker_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            board_system_id: 10,
            board_component_id: 250,
            camera_system_id: 10,
            camera_component_id: 100,
            board_endpoint_name: "boardendpoint".to_string(),
            camera_endpoint_name: "cameraendpoint".to_string(),
            router_controller_name: "routercontroller".to_string(),
            rc_socket_path: PathBuf::from("/tmp/unix_radio"),
            video_stream_ip_address: "192.168.0.10".to_string(),
            stream_hint_path: PathBuf::from("/var/lib/onboard-control/stream_hint"),
            wifi_ap_ip_address: "192.168.43.1".to_string(),
            wifi_ip_address_prefix: "192.168.43.".to_string(),
            board_temperature_path: PathBuf::from(
                "/sys/bus/iio/devices/iio:device1/in_voltage2_adc2_input",
            ),
            support_multiple_camera: false,
            support_camera_capture: false,
            in_air: true,
            bitrate_adjust_metric: BitrateMetric::Throughput,
            board_control_enabled: false,
            camera_control_enabled: false,
            wifi_control_enabled: false,
            d2d_tracker_enabled: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// A missing file is not fatal: the daemon runs on defaults, matching the
    /// behavior of a board shipped without a deployment config. A present but
    /// malformed file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("config file {} not found, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        toml::from_str(&contents).map_err(|e| ControlError::Config(e.to_string()))
    }
}
