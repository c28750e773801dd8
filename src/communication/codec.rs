//! MAVLink v2 frame codec
//!
//! One codec instance per link. Encoding stamps the sender identity and a
//! per-link sequence counter that wraps at 255; decoding accepts any single
//! well-formed v2 frame and rejects everything else without state.

use std::io::Cursor;

use mavlink::common::MavMessage;
use mavlink::peek_reader::PeekReader;
use mavlink::MavHeader;

use crate::error::{ControlError, Result};

/// Stateful encoder and stateless decoder for one MAVLink link.
pub struct FrameCodec {
    system_id: u8,
    component_id: u8,
    sequence: u8,
}

impl FrameCodec {
    pub fn new(system_id: u8, component_id: u8) -> Self {
        Self {
            system_id,
            component_id,
            sequence: 0,
        }
    }

    /// Serialize one message into a v2 frame, consuming a sequence number.
    pub fn encode(&mut self, msg: &MavMessage) -> Result<Vec<u8>> {
        let header = MavHeader {
            system_id: self.system_id,
            component_id: self.component_id,
            sequence: self.sequence,
        };
        self.sequence = self.sequence.wrapping_add(1);

        let mut buf = Cursor::new(Vec::with_capacity(280));
        mavlink::write_v2_msg(&mut buf, header, msg)
            .map_err(|e| ControlError::Encode(format!("{e:?}")))?;
        Ok(buf.into_inner())
    }

    /// Parse one frame out of a datagram. Garbage in front of the magic
    /// byte or a bad checksum both count as a parse failure.
    pub fn decode(data: &[u8]) -> Result<(MavHeader, MavMessage)> {
        let mut reader = PeekReader::new(Cursor::new(data));
        mavlink::read_v2_msg::<MavMessage, _>(&mut reader).map_err(|_| ControlError::Parse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::common::{
        HEARTBEAT_DATA, MavAutopilot, MavModeFlag, MavState, MavType,
    };

    fn heartbeat() -> MavMessage {
        MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_CAMERA,
            autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
            base_mode: MavModeFlag::empty(),
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        })
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut codec = FrameCodec::new(10, 100);
        let frame = codec.encode(&heartbeat()).unwrap();
        let (header, msg) = FrameCodec::decode(&frame).unwrap();
        assert_eq!(header.system_id, 10);
        assert_eq!(header.component_id, 100);
        assert_eq!(header.sequence, 0);
        assert!(matches!(msg, MavMessage::HEARTBEAT(_)));
    }

    #[test]
    fn test_sequence_increments_and_wraps() {
        let mut codec = FrameCodec::new(10, 100);
        for expected in 0u8..=255 {
            let frame = codec.encode(&heartbeat()).unwrap();
            let (header, _) = FrameCodec::decode(&frame).unwrap();
            assert_eq!(header.sequence, expected);
        }
        let frame = codec.encode(&heartbeat()).unwrap();
        let (header, _) = FrameCodec::decode(&frame).unwrap();
        assert_eq!(header.sequence, 0);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(FrameCodec::decode(&[0x00, 0x01, 0x02, 0x03]).is_err());
        assert!(FrameCodec::decode(&[]).is_err());
    }

    #[test]
    fn test_decode_rejects_corrupted_checksum() {
        let mut codec = FrameCodec::new(10, 100);
        let mut frame = codec.encode(&heartbeat()).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(FrameCodec::decode(&frame).is_err());
    }
}
