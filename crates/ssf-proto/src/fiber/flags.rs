//! Frame flags for the fiber header.
//!
//! Version 1 of the protocol defines no flag semantics; the byte exists so
//! that future versions can negotiate optional frame properties without a
//! layout change. All bits are reserved and MUST be zero on the wire.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Fiber frame flags (8 bits, all reserved in protocol version 1).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct FrameFlags: u8 {}
}

impl FrameFlags {
    /// Parse the flags byte, rejecting bits this version does not define.
    ///
    /// Returns `None` when any reserved bit is set. A frame carrying unknown
    /// flags is a protocol error, not something to ignore: flag bits may
    /// change framing semantics in later versions, and acting on a frame
    /// whose modifiers we do not understand would corrupt the stream.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        Self::from_bits(byte)
    }

    /// Convert to the raw wire byte.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        self.bits()
    }
}

impl Default for FrameFlags {
    fn default() -> Self {
        Self::empty()
    }
}
