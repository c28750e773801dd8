//! Subsystem state machines
//!
//! One module per concern, each split the same way: a pure logic type that
//! turns inputs into messages and is tested without sockets, plus a task
//! type that owns the descriptors, implements [`EventHandler`] and runs on
//! its own thread with its own reactor.
//!
//! [`EventHandler`]: crate::core::EventHandler

pub mod board_control;
pub mod camera_control;
pub mod d2d_tracker;
pub mod wifi_control;

pub use board_control::BoardControl;
pub use camera_control::CameraControl;
pub use d2d_tracker::D2dTracker;
pub use wifi_control::WifiControl;
