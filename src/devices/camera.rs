//! Camera service seam
//!
//! The camera daemon on the board accepts control calls but answers busy
//! while a previous transition is still settling, so every call site that
//! changes camera state goes through the busy-poll retry budget. The trait
//! mirrors the service call surface; subsystem tests script it with a mock.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::core::Transient;

/// How long a photo capture may take before it is reported as failed.
pub const CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

pub type CameraResult<T> = std::result::Result<T, CameraError>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CameraError {
    /// A transition is still in flight; retry shortly.
    #[error("camera busy")]
    Busy,
    #[error("operation not valid in state {0:?}")]
    WrongState(CameraState),
    #[error("capture did not complete in time")]
    CaptureTimeout,
    #[error("camera service failure: {0}")]
    Failed(String),
}

impl Transient for CameraError {
    fn is_transient(&self) -> bool {
        matches!(self, CameraError::Busy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CameraState {
    Idle,
    Open,
    ZslPreview,
    VideoPreview,
    Recording,
}

/// Preview pipeline mode: still-oriented ZSL or video-oriented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewMode {
    Zsl,
    Video,
}

/// Control surface of the camera service.
pub trait CameraDevice {
    fn open(&mut self) -> CameraResult<()>;
    fn close(&mut self) -> CameraResult<()>;
    fn start_preview(&mut self) -> CameraResult<()>;
    fn stop_preview(&mut self) -> CameraResult<()>;
    fn start_recording(&mut self) -> CameraResult<()>;
    fn stop_recording(&mut self) -> CameraResult<()>;
    /// Kick off a photo capture. Completion arrives on the returned signal;
    /// the caller decides how long to wait for it.
    fn capture_image(&mut self) -> CameraResult<CaptureSignal>;

    fn state(&self) -> CameraState;
    fn preview_size(&self) -> (u16, u16);
    fn set_preview_size(&mut self, width: u16, height: u16) -> CameraResult<()>;
    fn set_mode(&mut self, mode: PreviewMode) -> CameraResult<()>;

    fn camera_id(&self) -> u8;
    fn camera_count(&self) -> u8;
    fn set_camera_id(&mut self, id: u8) -> CameraResult<()>;

    /// Encoder bitrate hint; a negative sentinel parks the encoder in its
    /// dummy state.
    fn set_bitrate(&mut self, value: i32);
    /// Ask the encoder for an immediate keyframe.
    fn request_keyframe(&mut self);
}

/// Waiting side of the one-shot capture completion notification.
pub struct CaptureSignal {
    rx: Receiver<bool>,
}

/// Signalling side, handed to the capture completion callback.
#[derive(Clone)]
pub struct CaptureNotifier {
    tx: SyncSender<bool>,
}

/// One pair per capture attempt.
pub fn capture_signal() -> (CaptureNotifier, CaptureSignal) {
    let (tx, rx) = mpsc::sync_channel(1);
    (CaptureNotifier { tx }, CaptureSignal { rx })
}

impl CaptureNotifier {
    /// Report capture completion. A second call on the same pair is a no-op.
    pub fn notify(&self, success: bool) {
        let _ = self.tx.try_send(success);
    }
}

impl CaptureSignal {
    /// Block until the capture completes or the timeout lapses.
    pub fn wait(self) -> CameraResult<()> {
        self.wait_for(CAPTURE_TIMEOUT)
    }

    pub fn wait_for(self, timeout: Duration) -> CameraResult<()> {
        match self.rx.recv_timeout(timeout) {
            Ok(true) => Ok(()),
            Ok(false) => Err(CameraError::Failed("capture reported failure".to_string())),
            Err(RecvTimeoutError::Timeout) => Err(CameraError::CaptureTimeout),
            Err(RecvTimeoutError::Disconnected) => {
                Err(CameraError::Failed("capture source dropped".to_string()))
            }
        }
    }
}

/// Handle sharing one camera between the command subsystem and the link
/// tracker, which only touches the bitrate and keyframe knobs. Every call
/// takes the lock for its own duration; no call holds it across a wait.
pub struct SharedCamera<C> {
    inner: Arc<Mutex<C>>,
}

impl<C> Clone for SharedCamera<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C> SharedCamera<C> {
    pub fn new(camera: C) -> Self {
        Self {
            inner: Arc::new(Mutex::new(camera)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, C> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: CameraDevice> CameraDevice for SharedCamera<C> {
    fn open(&mut self) -> CameraResult<()> {
        self.lock().open()
    }

    fn close(&mut self) -> CameraResult<()> {
        self.lock().close()
    }

    fn start_preview(&mut self) -> CameraResult<()> {
        self.lock().start_preview()
    }

    fn stop_preview(&mut self) -> CameraResult<()> {
        self.lock().stop_preview()
    }

    fn start_recording(&mut self) -> CameraResult<()> {
        self.lock().start_recording()
    }

    fn stop_recording(&mut self) -> CameraResult<()> {
        self.lock().stop_recording()
    }

    fn capture_image(&mut self) -> CameraResult<CaptureSignal> {
        self.lock().capture_image()
    }

    fn state(&self) -> CameraState {
        self.lock().state()
    }

    fn preview_size(&self) -> (u16, u16) {
        self.lock().preview_size()
    }

    fn set_preview_size(&mut self, width: u16, height: u16) -> CameraResult<()> {
        self.lock().set_preview_size(width, height)
    }

    fn set_mode(&mut self, mode: PreviewMode) -> CameraResult<()> {
        self.lock().set_mode(mode)
    }

    fn camera_id(&self) -> u8 {
        self.lock().camera_id()
    }

    fn camera_count(&self) -> u8 {
        self.lock().camera_count()
    }

    fn set_camera_id(&mut self, id: u8) -> CameraResult<()> {
        self.lock().set_camera_id(id)
    }

    fn set_bitrate(&mut self, value: i32) {
        self.lock().set_bitrate(value)
    }

    fn request_keyframe(&mut self) {
        self.lock().request_keyframe()
    }
}

/// In-process camera model for boards shipped without the camera service.
///
/// Enforces the legal state transitions and completes captures immediately,
/// so the command surface stays exercisable end to end.
pub struct SimCamera {
    state: CameraState,
    mode: PreviewMode,
    width: u16,
    height: u16,
    id: u8,
    count: u8,
    bitrate: i32,
}

impl SimCamera {
    pub fn new(count: u8) -> Self {
        Self {
            state: CameraState::Idle,
            mode: PreviewMode::Zsl,
            width: 1280,
            height: 720,
            id: 0,
            count,
            bitrate: 0,
        }
    }

    fn transition(
        &mut self,
        from: &[CameraState],
        to: CameraState,
    ) -> CameraResult<()> {
        if !from.contains(&self.state) {
            return Err(CameraError::WrongState(self.state));
        }
        self.state = to;
        Ok(())
    }
}

impl CameraDevice for SimCamera {
    fn open(&mut self) -> CameraResult<()> {
        self.transition(&[CameraState::Idle], CameraState::Open)
    }

    fn close(&mut self) -> CameraResult<()> {
        self.transition(&[CameraState::Open], CameraState::Idle)
    }

    fn start_preview(&mut self) -> CameraResult<()> {
        let target = match self.mode {
            PreviewMode::Zsl => CameraState::ZslPreview,
            PreviewMode::Video => CameraState::VideoPreview,
        };
        self.transition(&[CameraState::Open], target)
    }

    fn stop_preview(&mut self) -> CameraResult<()> {
        self.transition(
            &[CameraState::ZslPreview, CameraState::VideoPreview],
            CameraState::Open,
        )
    }

    fn start_recording(&mut self) -> CameraResult<()> {
        self.transition(&[CameraState::VideoPreview], CameraState::Recording)
    }

    fn stop_recording(&mut self) -> CameraResult<()> {
        self.transition(&[CameraState::Recording], CameraState::VideoPreview)
    }

    fn capture_image(&mut self) -> CameraResult<CaptureSignal> {
        if self.state == CameraState::Idle {
            return Err(CameraError::WrongState(self.state));
        }
        let (notifier, signal) = capture_signal();
        notifier.notify(true);
        Ok(signal)
    }

    fn state(&self) -> CameraState {
        self.state
    }

    fn preview_size(&self) -> (u16, u16) {
        (self.width, self.height)
    }

    fn set_preview_size(&mut self, width: u16, height: u16) -> CameraResult<()> {
        self.width = width;
        self.height = height;
        Ok(())
    }

    fn set_mode(&mut self, mode: PreviewMode) -> CameraResult<()> {
        self.mode = mode;
        Ok(())
    }

    fn camera_id(&self) -> u8 {
        self.id
    }

    fn camera_count(&self) -> u8 {
        self.count
    }

    fn set_camera_id(&mut self, id: u8) -> CameraResult<()> {
        if self.state != CameraState::Idle {
            return Err(CameraError::WrongState(self.state));
        }
        if id >= self.count {
            return Err(CameraError::Failed(format!("no camera with index {id}")));
        }
        self.id = id;
        Ok(())
    }

    fn set_bitrate(&mut self, value: i32) {
        self.bitrate = value;
        log::debug!("encoder bitrate hint set to {value}");
    }

    fn request_keyframe(&mut self) {
        log::debug!("keyframe requested");
    }
}

#[cfg(test)]
pub mod mock {
    //! Scriptable camera used by the subsystem tests.

    use super::*;
    use std::collections::HashMap;

    /// What the mock's capture signal reports.
    #[derive(Default, Clone, Copy, PartialEq, Eq)]
    pub enum CaptureOutcome {
        #[default]
        Success,
        Failure,
        /// Never notifies, so the waiter times out.
        Silent,
    }

    #[derive(Default)]
    pub struct MockCamera {
        pub state: Option<CameraState>,
        pub width: u16,
        pub height: u16,
        pub id: u8,
        pub count: u8,
        /// Operations that answer busy this many times before succeeding.
        pub busy: HashMap<&'static str, u32>,
        /// Operations that fail outright.
        pub failing: Vec<&'static str>,
        pub calls: Vec<&'static str>,
        pub bitrates: Vec<i32>,
        pub keyframes: u32,
        pub capture_outcome: CaptureOutcome,
    }

    impl MockCamera {
        pub fn new() -> Self {
            Self {
                state: Some(CameraState::Idle),
                width: 1280,
                height: 720,
                id: 0,
                count: 1,
                ..Default::default()
            }
        }

        pub fn in_state(state: CameraState) -> Self {
            let mut cam = Self::new();
            cam.state = Some(state);
            cam
        }

        pub fn busy_times(mut self, op: &'static str, times: u32) -> Self {
            self.busy.insert(op, times);
            self
        }

        pub fn failing_on(mut self, op: &'static str) -> Self {
            self.failing.push(op);
            self
        }

        pub fn call_count(&self, op: &str) -> usize {
            self.calls.iter().filter(|c| **c == op).count()
        }

        fn step(&mut self, op: &'static str, next: CameraState) -> CameraResult<()> {
            self.calls.push(op);
            if let Some(left) = self.busy.get_mut(op) {
                if *left > 0 {
                    *left -= 1;
                    return Err(CameraError::Busy);
                }
            }
            if self.failing.contains(&op) {
                return Err(CameraError::Failed(format!("scripted failure in {op}")));
            }
            self.state = Some(next);
            Ok(())
        }
    }

    impl CameraDevice for MockCamera {
        fn open(&mut self) -> CameraResult<()> {
            self.step("open", CameraState::Open)
        }

        fn close(&mut self) -> CameraResult<()> {
            self.step("close", CameraState::Idle)
        }

        fn start_preview(&mut self) -> CameraResult<()> {
            self.step("start_preview", CameraState::ZslPreview)
        }

        fn stop_preview(&mut self) -> CameraResult<()> {
            self.step("stop_preview", CameraState::Open)
        }

        fn start_recording(&mut self) -> CameraResult<()> {
            self.step("start_recording", CameraState::Recording)
        }

        fn stop_recording(&mut self) -> CameraResult<()> {
            self.step("stop_recording", CameraState::VideoPreview)
        }

        fn capture_image(&mut self) -> CameraResult<CaptureSignal> {
            self.calls.push("capture_image");
            if self.failing.contains(&"capture_image") {
                return Err(CameraError::Failed("scripted capture failure".to_string()));
            }
            let (notifier, signal) = capture_signal();
            match self.capture_outcome {
                CaptureOutcome::Success => notifier.notify(true),
                CaptureOutcome::Failure => notifier.notify(false),
                CaptureOutcome::Silent => {}
            }
            Ok(signal)
        }

        fn state(&self) -> CameraState {
            self.state.unwrap_or(CameraState::Idle)
        }

        fn preview_size(&self) -> (u16, u16) {
            (self.width, self.height)
        }

        fn set_preview_size(&mut self, width: u16, height: u16) -> CameraResult<()> {
            self.calls.push("set_preview_size");
            if self.failing.contains(&"set_preview_size") {
                return Err(CameraError::Failed("scripted failure".to_string()));
            }
            self.width = width;
            self.height = height;
            Ok(())
        }

        fn set_mode(&mut self, _mode: PreviewMode) -> CameraResult<()> {
            self.calls.push("set_mode");
            if self.failing.contains(&"set_mode") {
                return Err(CameraError::Failed("scripted failure".to_string()));
            }
            Ok(())
        }

        fn camera_id(&self) -> u8 {
            self.id
        }

        fn camera_count(&self) -> u8 {
            self.count
        }

        fn set_camera_id(&mut self, id: u8) -> CameraResult<()> {
            self.calls.push("set_camera_id");
            if self.failing.contains(&"set_camera_id") {
                return Err(CameraError::Failed("scripted failure".to_string()));
            }
            self.id = id;
            Ok(())
        }

        fn set_bitrate(&mut self, value: i32) {
            self.bitrates.push(value);
        }

        fn request_keyframe(&mut self) {
            self.keyframes += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_signal_success() {
        let (notifier, signal) = capture_signal();
        notifier.notify(true);
        assert_eq!(signal.wait_for(Duration::from_millis(50)), Ok(()));
    }

    #[test]
    fn test_capture_signal_failure() {
        let (notifier, signal) = capture_signal();
        notifier.notify(false);
        assert!(matches!(
            signal.wait_for(Duration::from_millis(50)),
            Err(CameraError::Failed(_))
        ));
    }

    #[test]
    fn test_capture_signal_timeout() {
        let (_notifier, signal) = capture_signal();
        assert_eq!(
            signal.wait_for(Duration::from_millis(20)),
            Err(CameraError::CaptureTimeout)
        );
    }

    #[test]
    fn test_double_notify_is_harmless() {
        let (notifier, signal) = capture_signal();
        notifier.notify(true);
        notifier.notify(false);
        assert_eq!(signal.wait_for(Duration::from_millis(50)), Ok(()));
    }

    #[test]
    fn test_busy_is_transient() {
        assert!(CameraError::Busy.is_transient());
        assert!(!CameraError::CaptureTimeout.is_transient());
        assert!(!CameraError::Failed("x".to_string()).is_transient());
    }
}
