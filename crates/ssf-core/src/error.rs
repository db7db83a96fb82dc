//! Error types for the funnel core.
//!
//! Each subsystem has its own enum; layers translate a next-layer error into
//! their own taxonomy only when the semantics differ, otherwise they forward
//! it unchanged. `From` conversions exist only at real boundaries.

use thiserror::Error;

use ssf_proto::ProtocolError;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A field value is present but malformed
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A required field is absent
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// The configuration document itself could not be parsed
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors raised while establishing or using a protocol stack layer.
#[derive(Error, Debug)]
pub enum LayerError {
    /// A layer descriptor block is malformed
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Transport failure from the enclosed layer, forwarded unchanged
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),

    /// The proxy rejected the CONNECT request outright
    #[error("proxy rejected CONNECT with status {status}")]
    ProxyRejected {
        /// HTTP status code the proxy answered with
        status: u16,
    },

    /// No authentication scheme offered by the proxy can be satisfied with
    /// the configured credentials
    #[error("no supported proxy authentication scheme among: {offered}")]
    ProxyAuthUnsupported {
        /// Schemes the proxy offered
        offered: String,
    },

    /// Authentication rounds were exhausted without the proxy accepting
    #[error("proxy authentication failed after {rounds} rounds")]
    ProxyAuthFailed {
        /// Rounds attempted
        rounds: u32,
    },

    /// This layer's own handshake failed
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// A certificate or private key could not be loaded or validated
    #[error("certificate invalid: {0}")]
    CertificateInvalid(String),

    /// The operation was cancelled by a close
    #[error("operation aborted")]
    Aborted,
}

/// Errors raised by the fiber demultiplexer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DemuxError {
    /// The peer answered our open request with a reset
    #[error("connection refused by peer")]
    Refused,

    /// The fiber was reset by the peer while open
    #[error("connection reset by peer")]
    Reset,

    /// A frame arrived for a port with no fiber or acceptor
    #[error("unknown port: {0}")]
    UnknownPort(u32),

    /// The peer violated the framing protocol; the connection is torn down
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A frame failed checksum verification
    #[error("checksum mismatch on fiber frame")]
    ChecksumMismatch,

    /// The operation was cancelled by a local close
    #[error("operation aborted")]
    Aborted,

    /// The fiber or demux was already closed
    #[error("already closed")]
    AlreadyClosed,

    /// No ephemeral port is available for a new fiber
    #[error("ephemeral port range exhausted")]
    PortsExhausted,

    /// The requested local port already has a fiber, listener or datagram
    /// binding
    #[error("port {0} already in use")]
    PortInUse(u32),

    /// Underlying transport failure
    #[error("transport: {0}")]
    Transport(String),
}

impl From<ProtocolError> for DemuxError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::ChecksumMismatch { .. } => DemuxError::ChecksumMismatch,
            other => DemuxError::ProtocolViolation(other.to_string()),
        }
    }
}

impl From<std::io::Error> for DemuxError {
    fn from(err: std::io::Error) -> Self {
        DemuxError::Transport(err.to_string())
    }
}

/// Errors raised by the admin service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdminError {
    /// The peer sent a command id this version does not know
    #[error("unknown command id {0:#010x}")]
    UnknownCommand(u32),

    /// A requested microservice failed to start on the peer
    #[error("service start failed: {0}")]
    ServiceStartFailed(String),

    /// Two consecutive keep-alive round-trips went unanswered
    #[error("peer keep-alive timeout")]
    PeerTimeout,

    /// The admin fiber could not be established within the retry budget
    #[error("admin fiber unreachable after {attempts} attempts")]
    AdminUnreachable {
        /// Connect attempts made
        attempts: u32,
    },

    /// The request was cancelled by fiber teardown
    #[error("cancelled")]
    Cancelled,

    /// Wire-format failure on the admin fiber
    #[error("protocol: {0}")]
    Protocol(String),

    /// The admin fiber itself failed
    #[error("fiber: {0}")]
    Fiber(String),
}

impl From<ProtocolError> for AdminError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UnknownCommand(id) => AdminError::UnknownCommand(id),
            other => AdminError::Protocol(other.to_string()),
        }
    }
}

impl From<DemuxError> for AdminError {
    fn from(err: DemuxError) -> Self {
        match err {
            DemuxError::Aborted => AdminError::Cancelled,
            other => AdminError::Fiber(other.to_string()),
        }
    }
}
