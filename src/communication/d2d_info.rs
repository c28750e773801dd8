//! Radio link info protocol
//!
//! The modem service connects over a stream socket and sends one field per
//! message: a 4-byte big-endian length prefix followed by an ASCII
//! `TAG VALUE` body. Known tags carry the service state and the signal
//! metrics used for bitrate adaptation and RADIO_STATUS reporting.

use crate::error::{ControlError, Result};

/// Upper bound on one message body.
pub const MAX_MESSAGE_BYTES: usize = 100;

const SERVICE_STATUS_TAG: &str = "SRV_STAT";
const SIGNAL_STRENGTH_TAG: &str = "RSRP";
const UL_GRANT_BANDWIDTH_TAG: &str = "UL_BW";
const UL_DATA_RATE_TAG: &str = "UL_RATE";
const SNR_TAG: &str = "SNR";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Connected,
    Disconnected,
}

/// One decoded info field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum D2dField {
    ServiceStatus(ServiceStatus),
    /// Reference signal received power, dBm (negative in practice).
    Rsrp(i32),
    /// Uplink grant bandwidth, the throughput estimate.
    UlBandwidth(i32),
    UlRate(i32),
    Snr(i32),
}

/// Parse one `TAG VALUE` body. Unknown tags and malformed values are
/// reported, never silently mapped.
pub fn parse_field(body: &[u8]) -> Result<D2dField> {
    let text = std::str::from_utf8(body).map_err(|_| ControlError::Parse)?;
    let mut parts = text.split_whitespace();
    let tag = parts.next().ok_or(ControlError::Parse)?;
    let value = parts.next().ok_or(ControlError::Parse)?;

    match tag {
        SERVICE_STATUS_TAG => Ok(D2dField::ServiceStatus(if value == "1" {
            ServiceStatus::Connected
        } else {
            ServiceStatus::Disconnected
        })),
        SIGNAL_STRENGTH_TAG => Ok(D2dField::Rsrp(parse_i32(value)?)),
        UL_GRANT_BANDWIDTH_TAG => Ok(D2dField::UlBandwidth(parse_i32(value)?)),
        UL_DATA_RATE_TAG => Ok(D2dField::UlRate(parse_i32(value)?)),
        SNR_TAG => Ok(D2dField::Snr(parse_i32(value)?)),
        _ => Err(ControlError::Parse),
    }
}

fn parse_i32(value: &str) -> Result<i32> {
    value.parse().map_err(|_| ControlError::Parse)
}

/// Incremental decoder for the length-prefixed stream framing.
#[derive(Default)]
pub struct InfoFrameDecoder {
    buf: Vec<u8>,
}

impl InfoFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete message body, if one has fully arrived.
    ///
    /// An oversized or zero length prefix poisons the stream; the buffer is
    /// cleared so the connection can be dropped cleanly.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len == 0 || len > MAX_MESSAGE_BYTES {
            self.buf.clear();
            return Err(ControlError::Parse);
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        let body = self.buf[4..4 + len].to_vec();
        self.buf.drain(..4 + len);
        Ok(Some(body))
    }
}
