//! Admin message wire format.
//!
//! Control-plane messages exchanged on the reserved admin fiber. Each
//! message is a fixed 12-byte little-endian header (`serial | command id |
//! payload length`) followed by a CBOR payload whose schema is selected by
//! the command id.
//!
//! Serials correlate responses with requests: a response carries the serial
//! of the request it answers. The low bit of a dynamically allocated serial
//! encodes the originator (client even, server odd) so the two halves of
//! the protocol never collide; serials 1–3 are reserved (1 initial hello,
//! 3 keep-alive).

mod command;
mod header;
mod payloads;

use bytes::{BufMut, Bytes};

pub use command::CommandId;
pub use header::AdminHeader;
pub use payloads::{
    CreateService, CreateServiceReply, Hello, HelloReply, ServiceStatus, ServiceStatusCode,
    ServiceStatusReply, StopService, StopServiceReply,
};

use crate::errors::{ProtocolError, Result};

/// First dynamically allocated client serial (even).
pub const SERIAL_CLIENT_BASE: u32 = 4;
/// First dynamically allocated server serial (odd).
pub const SERIAL_SERVER_BASE: u32 = 5;
/// Reserved serial carrying the initial hello exchange.
pub const SERIAL_HELLO: u32 = 1;
/// Reserved serial carrying keep-alive probes.
pub const SERIAL_KEEPALIVE: u32 = 3;

/// A complete admin message: header fields plus the raw payload bytes.
///
/// The command id is kept raw here so the receive path can report an
/// [`ProtocolError::UnknownCommand`] with the offending value instead of
/// failing during header parse; [`AdminPayload::from_message`] performs the
/// typed decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminMessage {
    /// Request/response correlation serial
    pub serial: u32,
    /// Raw command id
    pub command_id: u32,
    /// CBOR payload bytes
    pub payload: Bytes,
}

impl AdminMessage {
    /// Encode the message into a buffer.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::PayloadTooLarge`] when the payload exceeds
    /// [`AdminHeader::MAX_PAYLOAD_LEN`].
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        if self.payload.len() > AdminHeader::MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: AdminHeader::MAX_PAYLOAD_LEN,
            });
        }

        #[allow(clippy::cast_possible_truncation)]
        let header = AdminHeader::new(self.serial, self.command_id, self.payload.len() as u32);
        dst.put_slice(&header.to_bytes());
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Decode a message from wire bytes.
    ///
    /// # Errors
    ///
    /// Header errors from [`AdminHeader::from_bytes`], or
    /// [`ProtocolError::FrameTruncated`] when fewer payload bytes are
    /// available than the header claims.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = AdminHeader::from_bytes(bytes)?;

        let payload_len = header.payload_len() as usize;
        let total = AdminHeader::SIZE + payload_len;
        if bytes.len() < total {
            return Err(ProtocolError::FrameTruncated {
                expected: payload_len,
                actual: bytes.len().saturating_sub(AdminHeader::SIZE),
            });
        }

        Ok(Self {
            serial: header.serial(),
            command_id: header.command_id(),
            payload: Bytes::copy_from_slice(&bytes[AdminHeader::SIZE..total]),
        })
    }

    /// Typed command id, if known.
    #[must_use]
    pub fn command(&self) -> Option<CommandId> {
        CommandId::from_u32(self.command_id)
    }
}

/// Typed admin payloads, one variant per command id.
///
/// Only the inner struct content is serialized (no variant tag): the header
/// command id already identifies the schema, and not repeating it prevents
/// mismatched id/payload pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminPayload {
    /// Version and capability exchange, client → server
    Hello(Hello),
    /// Version and capability exchange, server → client
    HelloReply(HelloReply),
    /// Keep-alive probe and its echo; no payload
    Keepalive,
    /// Start a microservice on the peer
    CreateService(CreateService),
    /// Outcome of a create request
    CreateServiceReply(CreateServiceReply),
    /// Stop a running microservice instance
    StopService(StopService),
    /// Outcome of a stop request
    StopServiceReply(StopServiceReply),
    /// Query a microservice instance's status
    ServiceStatus(ServiceStatus),
    /// Status query response
    ServiceStatusReply(ServiceStatusReply),
}

impl AdminPayload {
    /// The command id for this payload variant.
    #[must_use]
    pub const fn command_id(&self) -> CommandId {
        match self {
            Self::Hello(_) => CommandId::Hello,
            Self::HelloReply(_) => CommandId::HelloReply,
            Self::Keepalive => CommandId::Keepalive,
            Self::CreateService(_) => CommandId::CreateService,
            Self::CreateServiceReply(_) => CommandId::CreateServiceReply,
            Self::StopService(_) => CommandId::StopService,
            Self::StopServiceReply(_) => CommandId::StopServiceReply,
            Self::ServiceStatus(_) => CommandId::ServiceStatus,
            Self::ServiceStatusReply(_) => CommandId::ServiceStatusReply,
        }
    }

    /// Encode the payload body as CBOR.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::CborEncode`] if serialization fails.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let mut writer = dst.writer();

        match self {
            Self::Hello(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::HelloReply(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Keepalive => Ok(()),
            Self::CreateService(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::CreateServiceReply(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::StopService(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::StopServiceReply(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ServiceStatus(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ServiceStatusReply(inner) => ciborium::ser::into_writer(inner, &mut writer),
        }
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))
    }

    /// Decode a payload body for a known command id.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::PayloadTooLarge`] before any CBOR parsing, or
    /// [`ProtocolError::CborDecode`] on schema mismatch.
    pub fn decode(command: CommandId, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > AdminHeader::MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge {
                size: bytes.len(),
                max: AdminHeader::MAX_PAYLOAD_LEN,
            });
        }

        fn de<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
            ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
        }

        Ok(match command {
            CommandId::Hello => Self::Hello(de(bytes)?),
            CommandId::HelloReply => Self::HelloReply(de(bytes)?),
            CommandId::Keepalive => Self::Keepalive,
            CommandId::CreateService => Self::CreateService(de(bytes)?),
            CommandId::CreateServiceReply => Self::CreateServiceReply(de(bytes)?),
            CommandId::StopService => Self::StopService(de(bytes)?),
            CommandId::StopServiceReply => Self::StopServiceReply(de(bytes)?),
            CommandId::ServiceStatus => Self::ServiceStatus(de(bytes)?),
            CommandId::ServiceStatusReply => Self::ServiceStatusReply(de(bytes)?),
        })
    }

    /// Build a complete message carrying this payload under `serial`.
    ///
    /// # Errors
    ///
    /// Propagates CBOR encoding failures.
    pub fn into_message(self, serial: u32) -> Result<AdminMessage> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        Ok(AdminMessage {
            serial,
            command_id: self.command_id().to_u32(),
            payload: Bytes::from(buf),
        })
    }

    /// Parse the typed payload out of a raw message.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownCommand`] for an unrecognized command id, or
    /// CBOR decode failures.
    pub fn from_message(message: &AdminMessage) -> Result<Self> {
        let command = message
            .command()
            .ok_or(ProtocolError::UnknownCommand(message.command_id))?;
        Self::decode(command, &message.payload)
    }
}
