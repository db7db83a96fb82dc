//! Admin control plane.
//!
//! The admin service is a microservice pinned to the reserved fiber port
//! known to both peers. It runs as soon as the demux is up: the server
//! listens for the admin fiber and answers commands; the client connects
//! (with bounded retries), negotiates hello, requests its user services
//! and drives keep-alives.
//!
//! [`session`] holds the pure protocol state machine; [`service`] holds
//! the async driver that binds it to a fiber and a
//! [`ServiceManager`](crate::services::ServiceManager).

pub mod service;
pub mod session;

pub use service::{start_client, start_server, AdminClient, AdminEvent, AdminServer, ADMIN_PORT};
pub use session::{AdminAction, AdminRole, AdminSession, UserServiceSpec, ADMIN_VERSION};
