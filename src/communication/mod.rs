//! Transport and wire-format layer
//!
//! Everything below the subsystems that touches bytes: MAVLink v2 framing,
//! unix datagram endpoints toward the router, the router controller ack
//! protocol, and the length-prefixed link carrying radio metrics.

pub mod codec;
pub mod d2d_info;
pub mod endpoint;
pub mod router_ack;

pub use codec::FrameCodec;
pub use d2d_info::{parse_field, D2dField, InfoFrameDecoder, ServiceStatus};
pub use endpoint::Endpoint;
pub use router_ack::RouterClient;
