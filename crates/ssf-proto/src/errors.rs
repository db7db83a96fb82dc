//! Error types for wire-format parsing and validation.
//!
//! All errors are structured and testable. Transport and state-machine
//! errors live in `ssf-core`; this crate only reports what is wrong with
//! bytes.

use thiserror::Error;

/// Errors raised while encoding or decoding fiber frames and admin messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer is shorter than the fixed header size
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Expected minimum size in bytes
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Unsupported protocol version
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Unknown frame type byte
    #[error("invalid frame type: {0:#04x}")]
    InvalidFrameType(u8),

    /// Flag bits set that this protocol version does not define
    #[error("invalid flags: {0:#04x}")]
    InvalidFlags(u8),

    /// Reserved header byte was not zero
    #[error("reserved header byte must be zero, got {0:#04x}")]
    NonZeroReserved(u8),

    /// Header checksum does not match the computed CRC
    #[error("checksum mismatch: header carries {stored:#06x}, computed {computed:#06x}")]
    ChecksumMismatch {
        /// Checksum carried in the header
        stored: u16,
        /// Checksum computed over the received header
        computed: u16,
    },

    /// Payload exceeds the maximum allowed size
    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge {
        /// Actual payload size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Frame is truncated (header claims more payload than available)
    #[error("frame truncated: header claims {expected} payload bytes, only {actual} available")]
    FrameTruncated {
        /// Expected payload size from the header
        expected: usize,
        /// Actual bytes available
        actual: usize,
    },

    /// Unknown admin command id
    #[error("unknown command id: {0:#010x}")]
    UnknownCommand(u32),

    /// Failed to encode an admin payload as CBOR
    #[error("failed to encode CBOR: {0}")]
    CborEncode(String),

    /// Failed to decode an admin payload from CBOR
    #[error("failed to decode CBOR: {0}")]
    CborDecode(String),
}

/// Convenient Result alias for wire-format operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
