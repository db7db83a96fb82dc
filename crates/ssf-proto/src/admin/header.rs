//! Admin message header.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::errors::{ProtocolError, Result};

/// Fixed 12-byte admin message header (little-endian).
///
/// Layout: `serial (4) | command id (4) | payload length (4)`.
///
/// Unlike the fiber header there is no checksum: admin messages ride inside
/// a fiber, which already frames and checksums them.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct AdminHeader {
    serial: [u8; 4],
    command_id: [u8; 4],
    payload_len: [u8; 4],
}

impl AdminHeader {
    /// Size of the serialized header (12 bytes).
    pub const SIZE: usize = 12;

    /// Upper bound on admin payloads (1 MiB). Control-plane messages are
    /// small; anything bigger is a broken or hostile peer.
    pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

    /// Create a header.
    #[must_use]
    pub fn new(serial: u32, command_id: u32, payload_len: u32) -> Self {
        Self {
            serial: serial.to_le_bytes(),
            command_id: command_id.to_le_bytes(),
            payload_len: payload_len.to_le_bytes(),
        }
    }

    /// Parse a header from wire bytes.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::FrameTooShort`] for buffers under 12 bytes,
    /// [`ProtocolError::PayloadTooLarge`] when the claimed length exceeds
    /// [`Self::MAX_PAYLOAD_LEN`].
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let header = Self::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::FrameTooShort {
                expected: Self::SIZE,
                actual: bytes.len(),
            })?
            .0;

        let payload_len = header.payload_len() as usize;
        if payload_len > Self::MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: Self::MAX_PAYLOAD_LEN,
            });
        }

        Ok(header)
    }

    /// Serialize to the 12 wire bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(IntoBytes::as_bytes(self));
        arr
    }

    /// Correlation serial.
    #[must_use]
    pub fn serial(&self) -> u32 {
        u32::from_le_bytes(self.serial)
    }

    /// Raw command id.
    #[must_use]
    pub fn command_id(&self) -> u32 {
        u32::from_le_bytes(self.command_id)
    }

    /// Payload length claimed by the header.
    #[must_use]
    pub fn payload_len(&self) -> u32 {
        u32::from_le_bytes(self.payload_len)
    }
}

impl PartialEq for AdminHeader {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for AdminHeader {}
