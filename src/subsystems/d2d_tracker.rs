//! D2D link tracker
//!
//! Listens for the modem service, which connects over a stream socket and
//! reports one link field per connection. The tracker folds those samples
//! into three outputs: an encoder bitrate hint for the camera, a keyframe
//! request when the link comes back, and signal quality for the RC bridge
//! and the autopilot.

use std::io::Read;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixListener, UnixStream};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use mavlink::common::{MavMessage, RADIO_STATUS_DATA};

use crate::communication::{
    parse_field, D2dField, Endpoint, FrameCodec, InfoFrameDecoder, ServiceStatus,
};
use crate::config::{BitrateMetric, Config};
use crate::core::{EventHandler, Reactor, StopHandle, Token};
use crate::devices::CameraDevice;
use crate::error::Result;

const LISTENER_NAME: &str = "d2dinfo";
const READ_TIMEOUT: Duration = Duration::from_millis(100);
/// Bitrate hint sent while the link is down.
const DISCONNECTED_BITRATE: i32 = -99;
/// The metric value assumed before the first sample arrives.
const INITIAL_METRIC: i32 = 100;

/// Side effects of one link sample.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LinkUpdate {
    pub bitrate: Option<i32>,
    pub keyframe: bool,
    /// `(rssi, noise)` as non-negative magnitudes.
    pub radio: Option<(u8, u8)>,
}

/// Link state folding, independent of any socket.
///
/// The accumulated sample is refolded after every inbound field, not just
/// the one that changed: a disconnect immediately parks the encoder, and
/// any field refreshes the downstream signal quality pair.
pub struct D2dLogic {
    metric: BitrateMetric,
    status: ServiceStatus,
    last_metric: i32,
    rsrp: Option<i32>,
    snr: Option<i32>,
    ul_bandwidth: Option<i32>,
}

impl D2dLogic {
    pub fn new(metric: BitrateMetric) -> Self {
        Self {
            metric,
            status: ServiceStatus::Disconnected,
            last_metric: INITIAL_METRIC,
            rsrp: None,
            snr: None,
            ul_bandwidth: None,
        }
    }

    pub fn on_field(&mut self, field: D2dField) -> LinkUpdate {
        let mut update = LinkUpdate::default();
        match field {
            D2dField::ServiceStatus(status) => {
                if self.status == ServiceStatus::Disconnected
                    && status == ServiceStatus::Connected
                {
                    log::info!("d2d link restored, requesting keyframe");
                    update.keyframe = true;
                }
                self.status = status;
            }
            D2dField::Rsrp(rsrp) => self.rsrp = Some(rsrp),
            D2dField::UlBandwidth(bw) => self.ul_bandwidth = Some(bw),
            D2dField::Snr(snr) => self.snr = Some(snr),
            D2dField::UlRate(rate) => log::debug!("uplink rate {rate}"),
        }
        update.bitrate = self.bitrate_hint();
        update.radio = self.radio_quality();
        update
    }

    /// While disconnected every field pushes the dummy bitrate so the
    /// encoder backs off at once; while connected only changes to the
    /// selected metric propagate.
    fn bitrate_hint(&mut self) -> Option<i32> {
        if self.status == ServiceStatus::Disconnected {
            return Some(DISCONNECTED_BITRATE);
        }
        let value = match self.metric {
            BitrateMetric::Throughput => self.ul_bandwidth,
            BitrateMetric::SignalNoise => self.snr,
        }?;
        if value == self.last_metric {
            return None;
        }
        self.last_metric = value;
        Some(value)
    }

    /// RSSI and noise magnitudes from the accumulated RSRP and SNR. Values
    /// outside one unsigned byte mean a bogus sample, not a clamp.
    fn radio_quality(&self) -> Option<(u8, u8)> {
        let rsrp = self.rsrp?;
        let snr = self.snr?;
        let noise_floor = rsrp - snr;
        if !(-255..=0).contains(&rsrp) || !(-255..=0).contains(&noise_floor) {
            log::debug!("implausible signal sample rsrp={rsrp} snr={snr}, dropping");
            return None;
        }
        Some((rsrp.unsigned_abs() as u8, noise_floor.unsigned_abs() as u8))
    }
}

/// Reactor-driven side of the subsystem.
pub struct D2dTracker<C: CameraDevice> {
    config: Arc<Config>,
    listener: UnixListener,
    endpoint: Endpoint,
    codec: FrameCodec,
    camera: C,
    logic: D2dLogic,
    listener_token: Token,
}

impl<C: CameraDevice + Send + 'static> D2dTracker<C> {
    pub fn spawn(config: Arc<Config>, camera: C) -> Result<(StopHandle, JoinHandle<()>)> {
        let mut reactor = Reactor::new()?;
        let addr = SocketAddr::from_abstract_name(LISTENER_NAME.as_bytes())?;
        let listener = UnixListener::bind_addr(&addr)?;
        listener.set_nonblocking(true)?;
        let listener_token = reactor.register_raw(&listener)?;

        let mut task = Self {
            endpoint: Endpoint::unbound()?,
            codec: FrameCodec::new(config.board_system_id, config.board_component_id),
            logic: D2dLogic::new(config.bitrate_adjust_metric),
            config,
            listener,
            camera,
            listener_token,
        };
        let stop = reactor.stop_handle();
        let handle = std::thread::Builder::new()
            .name("d2d-tracker".to_string())
            .spawn(move || {
                if let Err(e) = reactor.run(&mut task) {
                    log::error!("d2d tracker loop failed: {e}");
                }
            })?;
        Ok((stop, handle))
    }

    fn apply(&mut self, update: LinkUpdate) {
        if let Some(bitrate) = update.bitrate {
            self.camera.set_bitrate(bitrate);
        }
        if update.keyframe {
            self.camera.request_keyframe();
        }
        if let Some((rssi, noise)) = update.radio {
            // Raw two-byte report for the RC bridge; the service may not be
            // up yet, which is not an error worth failing the loop for.
            if let Err(e) = self
                .endpoint
                .send_path(&self.config.rc_socket_path, &[rssi, noise])
            {
                log::debug!("rc signal report not delivered: {e}");
            }
            let msg = MavMessage::RADIO_STATUS(RADIO_STATUS_DATA {
                rxerrors: 0,
                fixed: 0,
                rssi,
                remrssi: 0,
                txbuf: 0,
                noise,
                remnoise: 0,
            });
            match self.codec.encode(&msg) {
                Ok(frame) => {
                    if let Err(e) = self
                        .endpoint
                        .send_abstract(&self.config.board_endpoint_name, &frame)
                    {
                        log::warn!("radio status not delivered to router: {e}");
                    }
                }
                Err(e) => log::warn!("failed to encode radio status: {e}"),
            }
        }
    }
}

/// The modem sends exactly one field per connection and hangs up.
fn read_one_frame(stream: &mut UnixStream) -> Result<Option<Vec<u8>>> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut decoder = InfoFrameDecoder::new();
    let mut buf = [0u8; 128];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(n) => {
                decoder.extend(&buf[..n]);
                if let Some(body) = decoder.next_frame()? {
                    return Ok(Some(body));
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        }
    }
}

impl<C: CameraDevice + Send + 'static> EventHandler for D2dTracker<C> {
    fn on_readable(&mut self, token: Token) -> Result<()> {
        debug_assert_eq!(token, self.listener_token);
        loop {
            let mut stream = match self.listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            match read_one_frame(&mut stream) {
                Ok(Some(body)) => match parse_field(&body) {
                    Ok(field) => {
                        let update = self.logic.on_field(field);
                        self.apply(update);
                    }
                    Err(e) => log::warn!("unparseable d2d field: {e}"),
                },
                Ok(None) => log::debug!("d2d connection closed without a frame"),
                Err(e) => log::warn!("d2d read failed: {e}"),
            }
        }
    }
}
