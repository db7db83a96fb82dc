//! Secure socket funnel core engine.
//!
//! A client/server tunnel that multiplexes many independent logical streams
//! over a single authenticated, encrypted transport, optionally traversing
//! HTTP proxies. This crate contains the whole engine below the CLI:
//!
//! - [`layer`]: the composable protocol stack — TCP, optional HTTP CONNECT
//!   proxy traversal, and mutual-auth TLS with a read-ahead pump. Layers are
//!   concrete values behind a common trait; stacks are composed at runtime
//!   from a descriptor.
//! - [`demux`]: the fiber demultiplexer — reliable, flow-controlled,
//!   bidirectional stream and datagram endpoints over one stream socket.
//! - [`admin`]: the control plane on the reserved admin fiber — startup
//!   negotiation, remote service lifecycle, keep-alive.
//! - [`services`]: the microservice framework (factory registry, manager,
//!   built-in echo service).
//! - [`config`]: the JSON configuration model shared with the CLI.
//! - [`session`]: client/server orchestration tying the pieces together.
//!
//! # Concurrency model
//!
//! Everything runs on one shared tokio runtime; correctness holds with any
//! worker count ≥ 1. There is no thread-per-fiber: the demux owns one reader
//! and one writer task per connection, the TLS pump owns one puller task per
//! socket, and user handles carry ids into shared tables instead of owning
//! sockets. Back-pressure is enforced by TCP buffers, the pump's high
//! watermark, and fiber credit windows — no queue in the engine is
//! unbounded.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod admin;
pub mod config;
pub mod demux;
pub mod error;
pub mod layer;
pub mod services;
pub mod session;

pub use config::Config;
pub use demux::{Fiber, FiberDemux, FiberListener};
pub use error::{AdminError, ConfigError, DemuxError, LayerError};
