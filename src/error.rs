use crate::devices::camera::CameraError;

/// Errors surfaced by the control daemon.
///
/// Steady-state errors degrade to "this one request failed" and are logged by
/// the reactor; only startup failures (multiplexer or socket creation) are
/// propagated out of a subsystem's `spawn`.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),

    #[error("frame encode failed: {0}")]
    Encode(String),

    #[error("no valid frame in datagram")]
    Parse,

    #[error("partial send: wrote {written} of {len} bytes")]
    PartialSend { written: usize, len: usize },

    #[error("camera: {0}")]
    Camera(#[from] CameraError),

    #[error("config error: {0}")]
    Config(String),

    #[error("endpoint {0} unavailable")]
    Endpoint(String),
}

pub type Result<T> = std::result::Result<T, ControlError>;
