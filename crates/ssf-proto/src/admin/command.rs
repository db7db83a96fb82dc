//! Admin command ids.
//!
//! Ids are organized in ranges: `0x000x` session (hello, keep-alive),
//! `0x001x` service lifecycle. A reply id is always `request + 1`, except
//! keep-alive, which is echoed back under the same id.

use serde_repr::{Deserialize_repr, Serialize_repr};

/// Admin command ids.
///
/// Serialized little-endian `u32` in the admin header. `#[repr(u32)]` pins
/// the values for wire compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u32)]
pub enum CommandId {
    /// Version/capability exchange request
    Hello = 0x0001,
    /// Version/capability exchange response
    HelloReply = 0x0002,
    /// Liveness probe, echoed by the receiver under the same serial
    Keepalive = 0x0003,

    /// Start a microservice (factory id + parameters)
    CreateService = 0x0010,
    /// Create outcome (instance id + status)
    CreateServiceReply = 0x0011,
    /// Stop a microservice instance
    StopService = 0x0012,
    /// Stop outcome
    StopServiceReply = 0x0013,
    /// Query instance status
    ServiceStatus = 0x0014,
    /// Status query response
    ServiceStatusReply = 0x0015,
}

impl CommandId {
    /// Convert to the raw wire value.
    #[must_use]
    pub const fn to_u32(self) -> u32 {
        self as u32
    }

    /// Convert from a raw wire value; `None` for unknown ids, which the
    /// admin service reports as `UnknownCommand`.
    #[must_use]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x0001 => Some(Self::Hello),
            0x0002 => Some(Self::HelloReply),
            0x0003 => Some(Self::Keepalive),
            0x0010 => Some(Self::CreateService),
            0x0011 => Some(Self::CreateServiceReply),
            0x0012 => Some(Self::StopService),
            0x0013 => Some(Self::StopServiceReply),
            0x0014 => Some(Self::ServiceStatus),
            0x0015 => Some(Self::ServiceStatusReply),
            _ => None,
        }
    }
}
