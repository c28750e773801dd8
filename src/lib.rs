//! onboard-control - companion-computer control daemon for UAVs
//!
//! This library bridges a MAVLink router with the board sensors, the camera
//! subsystem, the LTE/D2D radio-quality feed and WiFi client tracking, all
//! multiplexed over local datagram sockets inside a single process.
//!
//! Each subsystem runs its own single-threaded reactor on a dedicated thread;
//! the only state shared between threads is the immutable [`config::Config`]
//! and the camera collaborator handle.

// Reactor, retry policies and the event-handler seam
pub mod core;

// Frame codec, local datagram endpoints and the ASCII side protocols
pub mod communication;

// Hardware collaborator interfaces (camera, sensors, clock, neighbor table)
pub mod devices;

// The module state machines built on top of the layers above
pub mod subsystems;

pub mod config;
pub mod error;

pub use config::Config;
pub use error::{ControlError, Result};
