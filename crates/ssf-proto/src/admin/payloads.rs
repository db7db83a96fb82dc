//! CBOR payload schemas for admin commands.
//!
//! One struct per command; the command id in the header selects the schema,
//! so no variant tag appears on the wire.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

/// Microservice lifecycle status, carried as `u32` in replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u32)]
pub enum ServiceStatusCode {
    /// Factory known, no instance requested
    Registered = 0,
    /// Instance requested, not yet starting
    Requested = 1,
    /// Instance starting up
    Starting = 2,
    /// Instance running
    Running = 3,
    /// Instance shutting down
    Stopping = 4,
    /// Instance stopped cleanly
    Stopped = 5,
    /// Instance failed to start or crashed
    Failed = 6,
}

/// Version and capability exchange, sent by the client on the reserved
/// hello serial as soon as the admin fiber opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Admin protocol version
    pub version: u8,
    /// Capability bitset (reserved, zero today)
    pub capabilities: u64,
}

/// Server response to [`Hello`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloReply {
    /// Admin protocol version the server speaks
    pub version: u8,
    /// Capability bitset
    pub capabilities: u64,
}

/// Start a microservice on the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateService {
    /// Stable factory id of the service to start
    pub factory_id: u32,
    /// Free-form service parameters (addresses, ports, options)
    pub parameters: BTreeMap<String, String>,
}

/// Outcome of a [`CreateService`] request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateServiceReply {
    /// Instance id assigned by the peer; 0 when the start failed
    pub instance_id: u32,
    /// Status after the start attempt
    pub status: ServiceStatusCode,
}

/// Stop a running microservice instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopService {
    /// Instance to stop
    pub instance_id: u32,
}

/// Outcome of a [`StopService`] request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopServiceReply {
    /// Instance the reply refers to
    pub instance_id: u32,
    /// Status after the stop attempt
    pub status: ServiceStatusCode,
}

/// Query a microservice instance's status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Instance to query
    pub instance_id: u32,
}

/// Response to a [`ServiceStatus`] query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatusReply {
    /// Instance the reply refers to
    pub instance_id: u32,
    /// Current status
    pub status: ServiceStatusCode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_cbor_is_numeric() {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&ServiceStatusCode::Running, &mut buf).expect("encode");
        let decoded: u32 = ciborium::de::from_reader(buf.as_slice()).expect("decode");
        assert_eq!(decoded, 3);
    }

    #[test]
    fn create_service_cbor() {
        let mut parameters = BTreeMap::new();
        parameters.insert("local_port".to_string(), "7".to_string());
        parameters.insert("gateway".to_string(), "false".to_string());

        let request = CreateService { factory_id: 7, parameters };
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&request, &mut buf).expect("encode");
        let decoded: CreateService = ciborium::de::from_reader(buf.as_slice()).expect("decode");
        assert_eq!(decoded, request);
    }
}
