//! Camera command surface
//!
//! Serves the MAVLink camera protocol on behalf of the board camera: info,
//! settings and capture-status queries, mode and resolution changes, stream
//! and recording control, photo capture. Hardware state is re-queried
//! before every decision rather than cached, and every command ends in a
//! `COMMAND_ACK` aimed back at the requester. State-changing calls go
//! through the busy-poll budget because the camera service answers busy
//! while a previous transition settles.
//!
//! A 1 Hz heartbeat advertises the camera once it opened successfully; the
//! open is lazy, retried on every tick until it sticks.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use mavlink::common::{
    CameraCapFlags, CameraMode, MavAutopilot, MavCmd, MavMessage, MavModeFlag, MavResult,
    MavState, MavType, COMMAND_ACK_DATA, COMMAND_LONG_DATA, HEARTBEAT_DATA,
    CAMERA_CAPTURE_STATUS_DATA, CAMERA_IMAGE_CAPTURED_DATA, CAMERA_INFORMATION_DATA,
    CAMERA_SETTINGS_DATA, VIDEO_STREAM_INFORMATION_DATA, VIDEO_STREAM_STATUS_DATA,
};
use mavlink::MavHeader;
use nix::sys::socket::UnixAddr;

use crate::communication::{Endpoint, FrameCodec};
use crate::config::Config;
use crate::core::{EventHandler, Reactor, RetryPolicy, StopHandle, Token, BUSY_POLL};
use crate::devices::camera::CAPTURE_TIMEOUT;
use crate::devices::{CameraDevice, CameraResult, CameraState, PreviewMode};
use crate::error::Result;

const SOCKET_NAME: &str = "cameracontrol";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const RTSP_PORT: u16 = 8554;
const DEFAULT_PREVIEW: (u16, u16) = (1280, 720);

/// Command state machine, parameterized over the camera seam.
pub struct CameraLogic<D: CameraDevice> {
    device: D,
    uid: u32,
    support_capture: bool,
    stream_ip: String,
    hint_path: PathBuf,
    policy: RetryPolicy,
    capture_wait: Duration,
    ready: bool,
    /// Last resolution this module applied, restored after a camera switch.
    preview_width: u16,
    preview_height: u16,
    /// Count of successfully captured images; -1 until the first one.
    image_index: i32,
    src_system: u8,
    src_component: u8,
}

impl<D: CameraDevice> CameraLogic<D> {
    pub fn new(device: D, config: &Config) -> Self {
        let camera_count = if config.support_multiple_camera {
            device.camera_count()
        } else {
            1
        };
        Self {
            uid: compose_uid(std::process::id(), camera_count),
            support_capture: config.support_camera_capture,
            stream_ip: config.video_stream_ip_address.clone(),
            hint_path: config.stream_hint_path.clone(),
            policy: BUSY_POLL,
            capture_wait: CAPTURE_TIMEOUT,
            ready: false,
            preview_width: 0,
            preview_height: 0,
            image_index: -1,
            src_system: 0,
            src_component: 0,
            device,
        }
    }

    /// 1 Hz tick: advertise the camera once the hardware came up.
    pub fn heartbeat_tick(&mut self) -> Option<MavMessage> {
        if !self.ready {
            match self.device.open() {
                Ok(()) => self.ready = true,
                Err(e) => {
                    log::warn!("camera not ready yet: {e}");
                    return None;
                }
            }
        }
        Some(MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: self.uid,
            mavtype: MavType::MAV_TYPE_GENERIC,
            autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
            base_mode: MavModeFlag::empty(),
            system_status: if self.support_capture {
                MavState::MAV_STATE_ACTIVE
            } else {
                MavState::MAV_STATE_UNINIT
            },
            mavlink_version: 3,
        }))
    }

    /// Dispatch one inbound frame, emitting replies in protocol order.
    pub fn handle_frame(
        &mut self,
        header: &MavHeader,
        msg: &MavMessage,
        emit: &mut dyn FnMut(MavMessage),
    ) {
        match msg {
            MavMessage::COMMAND_LONG(cmd) => {
                self.src_system = header.system_id;
                self.src_component = header.component_id;
                self.dispatch_command(cmd, emit);
            }
            MavMessage::VIDEO_STREAM_STATUS(settings) => {
                self.handle_stream_settings(settings);
            }
            _ => {}
        }
    }

    fn dispatch_command(&mut self, cmd: &COMMAND_LONG_DATA, emit: &mut dyn FnMut(MavMessage)) {
        match cmd.command {
            MavCmd::MAV_CMD_REQUEST_CAMERA_INFORMATION => self.handle_camera_information(emit),
            MavCmd::MAV_CMD_REQUEST_VIDEO_STREAM_INFORMATION => {
                self.handle_stream_information(emit)
            }
            MavCmd::MAV_CMD_REQUEST_CAMERA_SETTINGS => self.handle_camera_settings(emit),
            MavCmd::MAV_CMD_SET_CAMERA_MODE => self.handle_set_mode(cmd.param2 as i32, emit),
            MavCmd::MAV_CMD_REQUEST_STORAGE_INFORMATION => {
                emit(self.ack(MavCmd::MAV_CMD_REQUEST_STORAGE_INFORMATION, true))
            }
            MavCmd::MAV_CMD_VIDEO_START_STREAMING => {
                self.handle_start_streaming(cmd.param1 as u8, emit)
            }
            MavCmd::MAV_CMD_VIDEO_STOP_STREAMING => {
                let success = self.retry(|d| d.stop_preview()).is_ok();
                emit(self.ack(MavCmd::MAV_CMD_VIDEO_STOP_STREAMING, success));
            }
            MavCmd::MAV_CMD_VIDEO_START_CAPTURE => {
                let success = self.retry(|d| d.start_recording()).is_ok();
                emit(self.ack(MavCmd::MAV_CMD_VIDEO_START_CAPTURE, success));
            }
            MavCmd::MAV_CMD_VIDEO_STOP_CAPTURE => {
                let success = self.retry(|d| d.stop_recording()).is_ok();
                emit(self.ack(MavCmd::MAV_CMD_VIDEO_STOP_CAPTURE, success));
            }
            MavCmd::MAV_CMD_IMAGE_START_CAPTURE => self.handle_image_capture(emit),
            MavCmd::MAV_CMD_REQUEST_CAMERA_CAPTURE_STATUS => self.handle_capture_status(emit),
            other => {
                log::debug!("command {other:?} unhandled, discarding");
            }
        }
    }

    fn handle_camera_information(&mut self, emit: &mut dyn FnMut(MavMessage)) {
        emit(self.ack(MavCmd::MAV_CMD_REQUEST_CAMERA_INFORMATION, true));
        let flags = CameraCapFlags::CAMERA_CAP_FLAGS_CAPTURE_VIDEO
            | CameraCapFlags::CAMERA_CAP_FLAGS_CAPTURE_IMAGE
            | CameraCapFlags::CAMERA_CAP_FLAGS_HAS_MODES;
        emit(MavMessage::CAMERA_INFORMATION(CAMERA_INFORMATION_DATA {
            vendor_name: fill_bytes(b"camera"),
            model_name: fill_bytes(b"camera"),
            flags,
            ..Default::default()
        }));
    }

    fn handle_stream_information(&mut self, emit: &mut dyn FnMut(MavMessage)) {
        emit(self.ack(MavCmd::MAV_CMD_REQUEST_VIDEO_STREAM_INFORMATION, true));
        let (width, height) = self.stream_resolution();
        let uri = format!("rtsp://{}:{}/H264Video", self.stream_ip, RTSP_PORT);
        emit(MavMessage::VIDEO_STREAM_INFORMATION(
            VIDEO_STREAM_INFORMATION_DATA {
                stream_id: self.device.camera_id(),
                count: self.device.camera_count(),
                resolution_h: width,
                resolution_v: height,
                uri: fill_bytes(uri.as_bytes()),
                ..Default::default()
            },
        ));
    }

    /// The resolution the streamer will serve. Before the preview pipeline
    /// is up the camera reports its power-on size, so the persisted hint
    /// wins until then.
    fn stream_resolution(&mut self) -> (u16, u16) {
        let live = self.device.preview_size();
        if self.device.state() >= CameraState::ZslPreview {
            return live;
        }
        let hinted = self.read_hint().unwrap_or(DEFAULT_PREVIEW);
        if live != hinted {
            log::debug!("preview not running, using hinted resolution {hinted:?}");
        }
        hinted
    }

    fn read_hint(&self) -> Option<(u16, u16)> {
        let text = std::fs::read_to_string(&self.hint_path).ok()?;
        let (w, h) = text.trim().split_once('x')?;
        Some((w.parse().ok()?, h.parse().ok()?))
    }

    fn write_hint(&self, width: u16, height: u16) {
        if let Some(parent) = self.hint_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&self.hint_path, format!("{width}x{height}\n")) {
            log::warn!("failed to persist stream hint: {e}");
        }
    }

    fn handle_camera_settings(&mut self, emit: &mut dyn FnMut(MavMessage)) {
        let mode = match self.device.state() {
            CameraState::ZslPreview => CameraMode::CAMERA_MODE_IMAGE,
            CameraState::VideoPreview => CameraMode::CAMERA_MODE_VIDEO,
            state => {
                log::warn!("camera settings requested in state {state:?}");
                emit(self.ack(MavCmd::MAV_CMD_REQUEST_CAMERA_SETTINGS, false));
                return;
            }
        };
        emit(self.ack(MavCmd::MAV_CMD_REQUEST_CAMERA_SETTINGS, true));
        emit(MavMessage::CAMERA_SETTINGS(CAMERA_SETTINGS_DATA {
            mode_id: mode,
            ..Default::default()
        }));
    }

    fn handle_set_mode(&mut self, mode: i32, emit: &mut dyn FnMut(MavMessage)) {
        let target = match mode {
            0 => PreviewMode::Zsl,
            1 => PreviewMode::Video,
            _ => {
                emit(self.ack(MavCmd::MAV_CMD_SET_CAMERA_MODE, false));
                return;
            }
        };
        let previewing = match self.device.state() {
            CameraState::ZslPreview | CameraState::VideoPreview => true,
            CameraState::Open => false,
            state => {
                log::warn!("set camera mode in state {state:?}");
                emit(self.ack(MavCmd::MAV_CMD_SET_CAMERA_MODE, false));
                return;
            }
        };
        if previewing && self.retry(|d| d.stop_preview()).is_err() {
            emit(self.ack(MavCmd::MAV_CMD_SET_CAMERA_MODE, false));
            return;
        }
        let success = self.device.set_mode(target).is_ok();
        if previewing && self.retry(|d| d.start_preview()).is_err() {
            log::error!("failed to restart preview after mode change");
        }
        emit(self.ack(MavCmd::MAV_CMD_SET_CAMERA_MODE, success));
    }

    fn handle_start_streaming(&mut self, id: u8, emit: &mut dyn FnMut(MavMessage)) {
        let success = if id == self.device.camera_id() {
            true
        } else {
            self.change_camera(id)
        };
        emit(self.ack(MavCmd::MAV_CMD_VIDEO_START_STREAMING, success));
    }

    /// Switch to another camera index: tear the pipeline down to idle,
    /// change the index, then rebuild what was running. Failures while
    /// rebuilding are logged but the switch itself already happened.
    fn change_camera(&mut self, id: u8) -> bool {
        let state = self.device.state();
        if state == CameraState::Recording {
            log::error!("refusing camera switch while recording");
            return false;
        }
        let opened = state != CameraState::Idle;
        let previewing =
            matches!(state, CameraState::ZslPreview | CameraState::VideoPreview);

        if previewing && self.retry(|d| d.stop_preview()).is_err() {
            log::error!("failed to stop preview before camera switch");
            return false;
        }
        if opened && self.device.close().is_err() {
            log::error!("failed to close camera before switch");
            return false;
        }
        if let Err(e) = self.device.set_camera_id(id) {
            log::error!("failed to select camera {id}: {e}");
            return false;
        }

        if opened && self.retry(|d| d.open()).is_err() {
            log::error!("failed to reopen camera after switch");
            return true;
        }
        if self.preview_width > 0 {
            let (w, h) = (self.preview_width, self.preview_height);
            if self.device.set_preview_size(w, h).is_err() {
                log::error!("failed to restore preview size {w}x{h}");
            }
        }
        if previewing && self.retry(|d| d.start_preview()).is_err() {
            log::error!("failed to restart preview after switch");
        }
        true
    }

    fn handle_image_capture(&mut self, emit: &mut dyn FnMut(MavMessage)) {
        // Accepted up front: the capture itself may take seconds.
        emit(self.ack(MavCmd::MAV_CMD_IMAGE_START_CAPTURE, true));
        let wait = self.capture_wait;
        let outcome = self
            .device
            .capture_image()
            .and_then(|signal| signal.wait_for(wait));
        let success = match outcome {
            Ok(()) => {
                self.image_index += 1;
                true
            }
            Err(e) => {
                log::error!("image capture failed: {e}");
                false
            }
        };
        emit(MavMessage::CAMERA_IMAGE_CAPTURED(
            CAMERA_IMAGE_CAPTURED_DATA {
                camera_id: 1,
                image_index: self.image_index,
                capture_result: success as i8,
                ..Default::default()
            },
        ));
    }

    fn handle_capture_status(&mut self, emit: &mut dyn FnMut(MavMessage)) {
        let (image_status, video_status) = match self.device.state() {
            CameraState::ZslPreview | CameraState::VideoPreview => (0, 0),
            CameraState::Recording => (0, 1),
            state => {
                log::warn!("capture status requested in state {state:?}");
                emit(self.ack(MavCmd::MAV_CMD_REQUEST_CAMERA_CAPTURE_STATUS, false));
                return;
            }
        };
        emit(self.ack(MavCmd::MAV_CMD_REQUEST_CAMERA_CAPTURE_STATUS, true));
        emit(MavMessage::CAMERA_CAPTURE_STATUS(
            CAMERA_CAPTURE_STATUS_DATA {
                image_status,
                video_status,
                available_capacity: 65535.0,
                ..Default::default()
            },
        ));
    }

    /// Resolution request from the stream consumer. Applied only when it
    /// differs from the live size, stopping and restoring the preview
    /// around the change when one is running.
    fn handle_stream_settings(&mut self, settings: &VIDEO_STREAM_STATUS_DATA) {
        let (width, height) = (settings.resolution_h, settings.resolution_v);
        if self.device.preview_size() == (width, height) {
            return;
        }
        let stopped = match self.device.state() {
            CameraState::ZslPreview | CameraState::VideoPreview => {
                if self.retry(|d| d.stop_preview()).is_err() {
                    log::error!("failed to stop preview for resolution change");
                    return;
                }
                true
            }
            CameraState::Open => false,
            state => {
                log::error!("resolution change requested in state {state:?}");
                return;
            }
        };
        match self.device.set_preview_size(width, height) {
            Ok(()) => {
                self.preview_width = width;
                self.preview_height = height;
                self.write_hint(width, height);
                log::info!("preview resolution set to {width}x{height}");
            }
            Err(e) => log::error!("failed to set preview size {width}x{height}: {e}"),
        }
        if stopped && self.retry(|d| d.start_preview()).is_err() {
            log::error!("failed to restore preview after resolution change");
        }
    }

    fn retry<F>(&mut self, mut op: F) -> CameraResult<()>
    where
        F: FnMut(&mut D) -> CameraResult<()>,
    {
        let policy = self.policy;
        policy.run_busy(|| op(&mut self.device))
    }

    fn ack(&self, command: MavCmd, success: bool) -> MavMessage {
        MavMessage::COMMAND_ACK(COMMAND_ACK_DATA {
            command,
            result: if success {
                MavResult::MAV_RESULT_ACCEPTED
            } else {
                MavResult::MAV_RESULT_FAILED
            },
            progress: 0,
            result_param2: 0,
            target_system: self.src_system,
            target_component: self.src_component,
        })
    }
}

/// Heartbeat uid: low 24 bits of the pid, camera count in the top byte.
fn compose_uid(pid: u32, camera_count: u8) -> u32 {
    (pid & 0x00FF_FFFF) | (u32::from(camera_count) << 24)
}

fn fill_bytes<const N: usize>(src: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    let len = src.len().min(N);
    out[..len].copy_from_slice(&src[..len]);
    out
}

/// Reactor-driven side of the subsystem.
pub struct CameraControl<D: CameraDevice> {
    config: Arc<Config>,
    endpoint: Endpoint,
    codec: FrameCodec,
    logic: CameraLogic<D>,
    timer_token: Token,
    socket_token: Token,
}

impl<D: CameraDevice + Send + 'static> CameraControl<D> {
    pub fn spawn(config: Arc<Config>, device: D) -> Result<(StopHandle, JoinHandle<()>)> {
        let mut reactor = Reactor::new()?;
        let endpoint = Endpoint::bind_abstract(SOCKET_NAME)?;
        let timer_token = reactor.register_timer(HEARTBEAT_INTERVAL)?;
        let socket_token = reactor.register_datagram(&endpoint)?;

        let mut task = Self {
            codec: FrameCodec::new(config.camera_system_id, config.camera_component_id),
            logic: CameraLogic::new(device, &config),
            config,
            endpoint,
            timer_token,
            socket_token,
        };
        let stop = reactor.stop_handle();
        let handle = std::thread::Builder::new()
            .name("camera-control".to_string())
            .spawn(move || {
                if let Err(e) = reactor.run(&mut task) {
                    log::error!("camera control loop failed: {e}");
                }
            })?;
        Ok((stop, handle))
    }

    fn send(&mut self, msg: &MavMessage) -> Result<()> {
        let frame = self.codec.encode(msg)?;
        self.endpoint
            .send_abstract(&self.config.camera_endpoint_name, &frame)
    }
}

impl<D: CameraDevice + Send + 'static> EventHandler for CameraControl<D> {
    fn on_timer(&mut self, token: Token) -> Result<()> {
        debug_assert_eq!(token, self.timer_token);
        if let Some(heartbeat) = self.logic.heartbeat_tick() {
            self.send(&heartbeat)?;
        }
        Ok(())
    }

    fn on_datagram(&mut self, token: Token, payload: &[u8], _src: Option<&UnixAddr>) -> Result<()> {
        debug_assert_eq!(token, self.socket_token);
        let (header, msg) = FrameCodec::decode(payload)?;
        let mut replies = Vec::new();
        self.logic
            .handle_frame(&header, &msg, &mut |m| replies.push(m));
        for reply in &replies {
            self.send(reply)?;
        }
        Ok(())
    }
}
