//! Fiber frame header with zero-copy parsing.
//!
//! The header is a fixed 16-byte structure serialized as raw binary, all
//! multi-byte integers little-endian. Fields are stored as raw byte arrays
//! so the struct has alignment 1 and can be cast directly from network
//! bytes.
//!
//! # Layout
//!
//! ```text
//! offset  size  field
//!      0     1  version        (0x01)
//!      1     1  type           (FrameType)
//!      2     1  flags          (reserved, zero in v1)
//!      3     1  reserved       (zero)
//!      4     4  source port    (u32 LE)
//!      8     4  dest port      (u32 LE)
//!     12     2  payload length (u16 LE)
//!     14     2  checksum       (u16 LE, CRC-16/CCITT)
//! ```
//!
//! The checksum is CRC-16/CCITT (the 0x1021 polynomial, 0xFFFF initial
//! value) computed over the 16 header bytes with the checksum field zeroed.

use crc::{Crc, CRC_16_IBM_3740};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    errors::{ProtocolError, Result},
    fiber::{FrameFlags, FrameType},
};

/// CRC-16/CCITT-FALSE, the variant with init 0xFFFF and no final XOR.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Fixed 16-byte fiber frame header (little-endian).
///
/// # Security
///
/// - **Zero-copy safety**: all fields are plain bytes, so every 16-byte
///   pattern is a structurally valid `FrameHeader`; casting untrusted bytes
///   cannot cause undefined behavior. Semantic validity (version, type,
///   flags, checksum) is checked by [`FrameHeader::from_bytes`].
/// - **Checksum**: guards against header corruption, not tampering; peer
///   authentication is the TLS layer's job.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FrameHeader {
    version: u8,
    frame_type: u8,
    flags: u8,
    reserved: u8,
    src_port: [u8; 4],
    dst_port: [u8; 4],
    pub(crate) payload_len: [u8; 2],
    checksum: [u8; 2],
}

impl FrameHeader {
    /// Size of the serialized header (16 bytes).
    pub const SIZE: usize = 16;

    /// Current protocol version.
    pub const VERSION: u8 = 0x01;

    /// Maximum payload a header can describe (`payload_len` is u16).
    pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

    /// Create a sealed header for the given type and ports.
    ///
    /// The payload length is set by [`FiberFrame::new`](crate::FiberFrame::new)
    /// and the checksum recomputed there; a header fresh from this
    /// constructor already carries a valid checksum for a zero-length
    /// payload.
    #[must_use]
    pub fn new(frame_type: FrameType, src_port: u32, dst_port: u32) -> Self {
        let mut header = Self {
            version: Self::VERSION,
            frame_type: frame_type.to_u8(),
            flags: FrameFlags::empty().to_byte(),
            reserved: 0,
            src_port: src_port.to_le_bytes(),
            dst_port: dst_port.to_le_bytes(),
            payload_len: [0; 2],
            checksum: [0; 2],
        };
        header.seal();
        header
    }

    /// Parse a header from network bytes.
    ///
    /// Validation order is cheapest-first: size, version, type, flags,
    /// reserved byte, then the CRC.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::FrameTooShort`] for buffers under 16 bytes
    /// - [`ProtocolError::UnsupportedVersion`] for a version mismatch
    /// - [`ProtocolError::InvalidFrameType`] for an unknown type byte
    /// - [`ProtocolError::InvalidFlags`] for reserved flag bits
    /// - [`ProtocolError::NonZeroReserved`] for a dirty reserved byte
    /// - [`ProtocolError::ChecksumMismatch`] when the CRC does not match
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let header = Self::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::FrameTooShort {
                expected: Self::SIZE,
                actual: bytes.len(),
            })?
            .0;

        if header.version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }

        if FrameType::from_u8(header.frame_type).is_none() {
            return Err(ProtocolError::InvalidFrameType(header.frame_type));
        }

        if FrameFlags::from_byte(header.flags).is_none() {
            return Err(ProtocolError::InvalidFlags(header.flags));
        }

        if header.reserved != 0 {
            return Err(ProtocolError::NonZeroReserved(header.reserved));
        }

        let stored = u16::from_le_bytes(header.checksum);
        let computed = header.compute_checksum();
        if stored != computed {
            return Err(ProtocolError::ChecksumMismatch { stored, computed });
        }

        Ok(header)
    }

    /// Serialize the header to its 16 wire bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(IntoBytes::as_bytes(self));
        arr
    }

    /// Recompute and store the checksum. Must be called after any field
    /// mutation; [`FiberFrame`](crate::FiberFrame) does this when it sets
    /// the payload length.
    pub(crate) fn seal(&mut self) {
        self.checksum = [0; 2];
        self.checksum = self.compute_checksum().to_le_bytes();
    }

    /// CRC-16 over the header bytes with the checksum field zeroed.
    fn compute_checksum(&self) -> u16 {
        let mut bytes = [0u8; Self::SIZE];
        bytes.copy_from_slice(IntoBytes::as_bytes(self));
        bytes[14] = 0;
        bytes[15] = 0;
        CRC16.checksum(&bytes)
    }

    /// Protocol version byte.
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Frame type, if the byte is a known type.
    #[must_use]
    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_u8(self.frame_type)
    }

    /// Raw frame type byte.
    #[must_use]
    pub fn frame_type_raw(&self) -> u8 {
        self.frame_type
    }

    /// Frame flags. Headers that passed [`from_bytes`](Self::from_bytes)
    /// always carry valid (empty) flags.
    #[must_use]
    pub fn flags(&self) -> FrameFlags {
        FrameFlags::from_byte(self.flags).unwrap_or_default()
    }

    /// Source fiber port.
    #[must_use]
    pub fn src_port(&self) -> u32 {
        u32::from_le_bytes(self.src_port)
    }

    /// Destination fiber port.
    #[must_use]
    pub fn dst_port(&self) -> u32 {
        u32::from_le_bytes(self.dst_port)
    }

    /// Payload length claimed by the header.
    #[must_use]
    pub fn payload_len(&self) -> u16 {
        u16::from_le_bytes(self.payload_len)
    }

    /// Stored checksum.
    #[must_use]
    pub fn checksum(&self) -> u16 {
        u16::from_le_bytes(self.checksum)
    }
}

impl PartialEq for FrameHeader {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for FrameHeader {}
