//! Frame type codes for the fiber demultiplexer.
//!
//! The type byte determines how the rest of the frame is interpreted:
//! stream frames drive per-fiber state machines, `Dgram` frames are
//! connectionless, and `Keepalive` frames only refresh link liveness.

use serde_repr::{Deserialize_repr, Serialize_repr};

/// Fiber frame types.
///
/// # Representation
///
/// Serialized as a single byte in the frame header. `#[repr(u8)]` pins the
/// numeric values for wire compatibility.
///
/// Unknown type bytes MUST be rejected with
/// [`ProtocolError::InvalidFrameType`](crate::ProtocolError::InvalidFrameType),
/// never silently ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum FrameType {
    /// Ordered stream payload bytes
    StreamData = 0x01,
    /// Open a fiber to the destination port
    StreamSyn = 0x02,
    /// Accept a fiber open request
    StreamSynAck = 0x03,
    /// Reject or abort a fiber
    StreamRst = 0x04,
    /// Half-close the sender's write direction
    StreamFin = 0x05,
    /// Return receive credits to the sender
    StreamAck = 0x06,
    /// Connectionless datagram
    Dgram = 0x07,
    /// Link liveness probe; carries no payload
    Keepalive = 0x08,
}

impl FrameType {
    /// Convert to the raw wire byte.
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Convert from a raw wire byte.
    ///
    /// Total over all byte values; returns `None` for unknown types so the
    /// caller can reject the frame explicitly.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::StreamData),
            0x02 => Some(Self::StreamSyn),
            0x03 => Some(Self::StreamSynAck),
            0x04 => Some(Self::StreamRst),
            0x05 => Some(Self::StreamFin),
            0x06 => Some(Self::StreamAck),
            0x07 => Some(Self::Dgram),
            0x08 => Some(Self::Keepalive),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_type_round_trip() {
        for value in 0x01..=0x08 {
            let ty = FrameType::from_u8(value).expect("known type");
            assert_eq!(ty.to_u8(), value);
        }
    }

    #[test]
    fn invalid_frame_type() {
        assert_eq!(FrameType::from_u8(0x00), None);
        assert_eq!(FrameType::from_u8(0x09), None);
        assert_eq!(FrameType::from_u8(0xFF), None);
    }
}
