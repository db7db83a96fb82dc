//! Fiber frame wire format.
//!
//! Every packet exchanged by the stream demultiplexer is a fiber frame: a
//! fixed 16-byte little-endian header followed by an opaque payload. The
//! header carries the frame type, source and destination fiber ports, the
//! payload length, and a CRC-16/CCITT checksum over the header itself.

mod flags;
mod frame;
mod frame_type;
mod header;

pub use flags::FrameFlags;
pub use frame::FiberFrame;
pub use frame_type::FrameType;
pub use header::FrameHeader;
