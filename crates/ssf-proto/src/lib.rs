//! Wire formats for the secure socket funnel.
//!
//! This crate defines the two normative on-wire encodings and nothing else —
//! no I/O, no state machines:
//!
//! - **Fiber frames** ([`fiber`]): the 16-byte little-endian framing used by
//!   the stream demultiplexer, checksummed with CRC-16/CCITT.
//! - **Admin messages** ([`admin`]): the 12-byte little-endian control-plane
//!   framing carried on the reserved admin fiber, with CBOR payloads.
//!
//! Both formats are bit-exact contracts between peers; round-trip laws
//! (`decode(encode(x)) == x`) are enforced by property tests.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod admin;
pub mod errors;
pub mod fiber;

pub use admin::{AdminHeader, AdminMessage, AdminPayload, CommandId, ServiceStatusCode};
pub use errors::{ProtocolError, Result};
pub use fiber::{FiberFrame, FrameFlags, FrameHeader, FrameType};
