//! Board telemetry and time synchronization
//!
//! On a 500 ms tick the airborne unit re-reads the board temperature sensor
//! and reports changes as `SCALED_PRESSURE` (the temperature field is the
//! only one populated), and paces `TIMESYNC` requests toward the ground
//! station: every tick until the first response arrives, then once a minute.
//! A response steps the wall clock only when the drift exceeds one minute.
//! Configured as the ground unit, the module answers requests instead.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use mavlink::common::{MavMessage, SCALED_PRESSURE_DATA, TIMESYNC_DATA};
use nix::sys::socket::UnixAddr;

use crate::communication::{Endpoint, FrameCodec};
use crate::config::Config;
use crate::core::{EventHandler, Reactor, StopHandle, Token};
use crate::devices::{Clock, SysfsScalar, SystemClock};
use crate::error::Result;

const SOCKET_NAME: &str = "boardcontrol";
const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Ticks between requests before and after the first response.
const SYNC_RATE_UNSYNCED: u32 = 1;
const SYNC_RATE_SYNCED: u32 = 60;

/// Largest tolerated offset before the clock is stepped.
const MAX_DRIFT_SECS: i64 = 60;

/// Pure tick and message logic, parameterized over the wall clock.
pub struct BoardLogic<C: Clock> {
    clock: C,
    in_air: bool,
    last_temperature: Option<i32>,
    sync_counter: u32,
    synced: bool,
}

impl<C: Clock> BoardLogic<C> {
    pub fn new(clock: C, in_air: bool) -> Self {
        Self {
            clock,
            in_air,
            last_temperature: None,
            sync_counter: 0,
            synced: false,
        }
    }

    /// One 500 ms tick. `temperature` is the fresh sensor reading, absent
    /// when the read failed.
    pub fn on_tick(&mut self, temperature: Option<i32>) -> Result<Vec<MavMessage>> {
        let mut out = Vec::new();
        if !self.in_air {
            return Ok(out);
        }

        if let Some(reading) = temperature {
            if self.last_temperature != Some(reading) {
                self.last_temperature = Some(reading);
                log::debug!("board temperature changed to {reading}");
                out.push(MavMessage::SCALED_PRESSURE(SCALED_PRESSURE_DATA {
                    temperature: (reading / 10) as i16,
                    ..Default::default()
                }));
            }
        }

        let rate = if self.synced {
            SYNC_RATE_SYNCED
        } else {
            SYNC_RATE_UNSYNCED
        };
        self.sync_counter += 1;
        if self.sync_counter >= rate {
            self.sync_counter = 0;
            out.push(MavMessage::TIMESYNC(TIMESYNC_DATA {
                tc1: self.clock.now_epoch_secs()?,
                ts1: 0,
                ..Default::default()
            }));
        }
        Ok(out)
    }

    /// Inbound `TIMESYNC`: a request when we are the ground side, a
    /// response when we are airborne.
    pub fn on_timesync(&mut self, tc1: i64, ts1: i64) -> Result<Vec<MavMessage>> {
        if !self.in_air {
            if tc1 > 0 && ts1 == 0 {
                let now = self.clock.now_epoch_secs()?;
                log::debug!("answering time sync request, local time {now}");
                return Ok(vec![MavMessage::TIMESYNC(TIMESYNC_DATA {
                    tc1,
                    ts1: now,
                    ..Default::default()
                })]);
            }
            return Ok(Vec::new());
        }

        if ts1 > 0 {
            self.synced = true;
            let now = self.clock.now_epoch_secs()?;
            let drift = ts1 - now;
            if drift.abs() > MAX_DRIFT_SECS {
                log::info!("stepping clock from {now} to {ts1}");
                self.clock.set_epoch_secs(ts1)?;
            }
        }
        Ok(Vec::new())
    }
}

/// Reactor-driven side of the subsystem.
pub struct BoardControl {
    config: Arc<Config>,
    endpoint: Endpoint,
    codec: FrameCodec,
    sensor: SysfsScalar,
    logic: BoardLogic<SystemClock>,
    timer_token: Token,
    socket_token: Token,
}

impl BoardControl {
    /// Start the subsystem on its own thread. The returned handle stops it.
    pub fn spawn(config: Arc<Config>) -> Result<(StopHandle, JoinHandle<()>)> {
        let mut reactor = Reactor::new()?;
        let endpoint = Endpoint::bind_abstract(SOCKET_NAME)?;
        let timer_token = reactor.register_timer(TICK_INTERVAL)?;
        let socket_token = reactor.register_datagram(&endpoint)?;

        let mut task = Self {
            codec: FrameCodec::new(config.board_system_id, config.board_component_id),
            sensor: SysfsScalar::new(config.board_temperature_path.clone()),
            logic: BoardLogic::new(SystemClock, config.in_air),
            config,
            endpoint,
            timer_token,
            socket_token,
        };
        let stop = reactor.stop_handle();
        let handle = std::thread::Builder::new()
            .name("board-control".to_string())
            .spawn(move || {
                if let Err(e) = reactor.run(&mut task) {
                    log::error!("board control loop failed: {e}");
                }
            })?;
        Ok((stop, handle))
    }

    fn send_all(&mut self, messages: Vec<MavMessage>) -> Result<()> {
        for msg in messages {
            let frame = self.codec.encode(&msg)?;
            self.endpoint
                .send_abstract(&self.config.board_endpoint_name, &frame)?;
        }
        Ok(())
    }
}

impl EventHandler for BoardControl {
    fn on_timer(&mut self, token: Token) -> Result<()> {
        debug_assert_eq!(token, self.timer_token);
        let temperature = match self.sensor.read() {
            Ok(value) => Some(value),
            Err(e) => {
                log::debug!("temperature read failed: {e}");
                None
            }
        };
        let messages = self.logic.on_tick(temperature)?;
        self.send_all(messages)
    }

    fn on_datagram(&mut self, token: Token, payload: &[u8], _src: Option<&UnixAddr>) -> Result<()> {
        debug_assert_eq!(token, self.socket_token);
        let (_, msg) = FrameCodec::decode(payload)?;
        if let MavMessage::TIMESYNC(sync) = msg {
            let replies = self.logic.on_timesync(sync.tc1, sync.ts1)?;
            self.send_all(replies)?;
        }
        Ok(())
    }
}
