//! Hardware and kernel seams
//!
//! Each device the daemon touches sits behind a small trait or struct so
//! the subsystems stay testable: the camera service, the sysfs temperature
//! sensor, the system clock, and the kernel neighbor table.

pub mod camera;
pub mod clock;
pub mod neighbor;
pub mod sensors;

pub use camera::{
    capture_signal, CameraDevice, CameraError, CameraResult, CameraState, CaptureNotifier,
    CaptureSignal, PreviewMode, SharedCamera, SimCamera,
};
pub use clock::{Clock, SystemClock};
pub use neighbor::{NeighborEvent, NeighborMonitor, NeighborState, RtnetlinkMonitor};
pub use sensors::SysfsScalar;
