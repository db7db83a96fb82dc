//! Admin protocol state machine.
//!
//! Pure logic, no I/O: methods take incoming messages (and the current
//! time, for keep-alive bookkeeping) and return actions for the driver to
//! execute. This keeps the whole control-plane protocol deterministic and
//! testable without sockets or timers.
//!
//! # Serials
//!
//! A response carries the serial of its request. Serial 1 carries the
//! initial hello, serial 3 the keep-alives; dynamic allocation starts at 4
//! on the client and 5 on the server, stepping by two, so the low bit
//! encodes the originator and the halves never collide.
//!
//! # Keep-alive
//!
//! The client ticks every 120 s; each tick sends a probe the server must
//! echo. A tick that finds two probes still unanswered tears the
//! connection down with `PeerTimeout` — 240 s after the last answer.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use ssf_proto::admin::{
    CreateService, CreateServiceReply, Hello, HelloReply, ServiceStatusReply, StopServiceReply,
    SERIAL_CLIENT_BASE, SERIAL_HELLO, SERIAL_KEEPALIVE, SERIAL_SERVER_BASE,
};
use ssf_proto::{AdminMessage, AdminPayload, ServiceStatusCode};

use crate::error::AdminError;

/// Admin protocol version.
pub const ADMIN_VERSION: u8 = 1;

/// Unanswered keep-alive probes that trigger teardown.
const KEEPALIVE_MISS_LIMIT: u32 = 2;

/// One user service the client asks the server to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserServiceSpec {
    /// Display name (configuration key)
    pub name: String,
    /// Factory id to start on the peer
    pub factory_id: u32,
    /// Parameters forwarded verbatim
    pub parameters: BTreeMap<String, String>,
}

/// Which side of the protocol this session speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminRole {
    /// Initiates hello, service creation and keep-alives
    Client,
    /// Answers commands
    Server,
}

/// Actions the driver executes on the session's behalf.
#[derive(Debug)]
pub enum AdminAction {
    /// Write this message to the admin fiber
    Send(AdminMessage),
    /// Server: start a service, then call
    /// [`AdminSession::local_create_done`] with the outcome
    StartService {
        /// Serial to answer under
        serial: u32,
        /// Factory to instantiate
        factory_id: u32,
        /// Request parameters
        parameters: BTreeMap<String, String>,
    },
    /// Server: stop an instance, then call
    /// [`AdminSession::local_stop_done`]
    StopService {
        /// Serial to answer under
        serial: u32,
        /// Instance to stop
        instance_id: u32,
    },
    /// Server: query an instance, then call
    /// [`AdminSession::local_status_done`]
    QueryStatus {
        /// Serial to answer under
        serial: u32,
        /// Instance queried
        instance_id: u32,
    },
    /// Client: a user service reached an outcome (remote instance id on
    /// success)
    UserService {
        /// Index into the spec list handed to [`AdminSession::client`]
        index: usize,
        /// Remote instance id, or the failure
        result: Result<u32, AdminError>,
    },
    /// Client: every `CreateService` has been acknowledged
    Initialized(Result<(), AdminError>),
    /// Tear the connection down
    Teardown(AdminError),
}

/// What an in-flight request serial is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    UserService(usize),
    Stop,
    Status,
}

/// The admin protocol state machine for one connection.
pub struct AdminSession {
    role: AdminRole,
    next_serial: u32,
    pending: HashMap<u32, Pending>,
    user_services: Vec<UserServiceSpec>,
    acked: usize,
    initialized_sent: bool,
    hello_done: bool,
    keepalive_outstanding: u32,
    last_keepalive: Option<Instant>,
}

impl AdminSession {
    /// Client session that will request `user_services` after hello.
    #[must_use]
    pub fn client(user_services: Vec<UserServiceSpec>) -> Self {
        Self {
            role: AdminRole::Client,
            next_serial: SERIAL_CLIENT_BASE,
            pending: HashMap::new(),
            user_services,
            acked: 0,
            initialized_sent: false,
            hello_done: false,
            keepalive_outstanding: 0,
            last_keepalive: None,
        }
    }

    /// Server session.
    #[must_use]
    pub fn server() -> Self {
        Self {
            role: AdminRole::Server,
            next_serial: SERIAL_SERVER_BASE,
            pending: HashMap::new(),
            user_services: Vec::new(),
            acked: 0,
            initialized_sent: false,
            hello_done: false,
            keepalive_outstanding: 0,
            last_keepalive: None,
        }
    }

    /// Role of this session.
    #[must_use]
    pub fn role(&self) -> AdminRole {
        self.role
    }

    /// In-flight request count (one handler per serial).
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// The admin fiber just opened.
    ///
    /// # Errors
    ///
    /// CBOR encoding failures (cannot happen for hello, kept explicit).
    pub fn on_open(&mut self) -> Result<Vec<AdminAction>, AdminError> {
        match self.role {
            AdminRole::Client => {
                let hello = AdminPayload::Hello(Hello {
                    version: ADMIN_VERSION,
                    capabilities: 0,
                });
                Ok(vec![AdminAction::Send(hello.into_message(SERIAL_HELLO)?)])
            }
            AdminRole::Server => Ok(Vec::new()),
        }
    }

    /// Process one inbound admin message.
    ///
    /// Unknown commands and unknown response serials are logged and
    /// dropped (empty action list), never fatal.
    ///
    /// # Errors
    ///
    /// Only wire-format failures (malformed CBOR for a known command).
    pub fn handle_message(&mut self, message: &AdminMessage) -> Result<Vec<AdminAction>, AdminError> {
        let payload = match AdminPayload::from_message(message) {
            Ok(payload) => payload,
            Err(err @ ssf_proto::ProtocolError::UnknownCommand(_)) => {
                tracing::warn!(serial = message.serial, error = %err, "dropping unknown command");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        };

        match (self.role, payload) {
            // --- server side ---------------------------------------
            (AdminRole::Server, AdminPayload::Hello(hello)) => {
                if hello.version != ADMIN_VERSION {
                    return Ok(vec![AdminAction::Teardown(AdminError::Protocol(format!(
                        "peer admin version {} unsupported",
                        hello.version
                    )))]);
                }
                self.hello_done = true;
                let reply = AdminPayload::HelloReply(HelloReply {
                    version: ADMIN_VERSION,
                    capabilities: 0,
                });
                Ok(vec![AdminAction::Send(reply.into_message(message.serial)?)])
            }
            (AdminRole::Server, AdminPayload::CreateService(request)) => {
                Ok(vec![AdminAction::StartService {
                    serial: message.serial,
                    factory_id: request.factory_id,
                    parameters: request.parameters,
                }])
            }
            (AdminRole::Server, AdminPayload::StopService(request)) => {
                Ok(vec![AdminAction::StopService {
                    serial: message.serial,
                    instance_id: request.instance_id,
                }])
            }
            (AdminRole::Server, AdminPayload::ServiceStatus(request)) => {
                Ok(vec![AdminAction::QueryStatus {
                    serial: message.serial,
                    instance_id: request.instance_id,
                }])
            }
            (AdminRole::Server, AdminPayload::Keepalive) => {
                // Echo under the same serial.
                Ok(vec![AdminAction::Send(
                    AdminPayload::Keepalive.into_message(message.serial)?,
                )])
            }

            // --- client side ---------------------------------------
            (AdminRole::Client, AdminPayload::HelloReply(reply)) => {
                if reply.version != ADMIN_VERSION {
                    return Ok(vec![AdminAction::Teardown(AdminError::Protocol(format!(
                        "peer admin version {} unsupported",
                        reply.version
                    )))]);
                }
                self.hello_done = true;
                self.request_user_services()
            }
            (AdminRole::Client, AdminPayload::CreateServiceReply(reply)) => {
                self.on_create_reply(message.serial, &reply)
            }
            (AdminRole::Client, AdminPayload::StopServiceReply(_reply)) => {
                match self.pending.remove(&message.serial) {
                    Some(Pending::Stop) => Ok(Vec::new()),
                    _ => {
                        tracing::warn!(serial = message.serial, "stop reply for unknown serial");
                        Ok(Vec::new())
                    }
                }
            }
            (AdminRole::Client, AdminPayload::ServiceStatusReply(_reply)) => {
                match self.pending.remove(&message.serial) {
                    Some(Pending::Status) => Ok(Vec::new()),
                    _ => {
                        tracing::warn!(serial = message.serial, "status reply for unknown serial");
                        Ok(Vec::new())
                    }
                }
            }
            (AdminRole::Client, AdminPayload::Keepalive) => {
                // The echo of our probe.
                self.keepalive_outstanding = 0;
                Ok(Vec::new())
            }

            (role, payload) => {
                tracing::warn!(
                    ?role,
                    command = ?payload.command_id(),
                    serial = message.serial,
                    "dropping message unexpected for role"
                );
                Ok(Vec::new())
            }
        }
    }

    fn request_user_services(&mut self) -> Result<Vec<AdminAction>, AdminError> {
        if self.user_services.is_empty() {
            self.initialized_sent = true;
            return Ok(vec![AdminAction::Initialized(Ok(()))]);
        }

        let mut actions = Vec::with_capacity(self.user_services.len());
        for index in 0..self.user_services.len() {
            let factory_id = self.user_services[index].factory_id;
            let parameters = self.user_services[index].parameters.clone();
            let serial = self.alloc_serial();
            self.pending.insert(serial, Pending::UserService(index));
            let request = AdminPayload::CreateService(CreateService {
                factory_id,
                parameters,
            });
            actions.push(AdminAction::Send(request.into_message(serial)?));
        }
        Ok(actions)
    }

    fn on_create_reply(
        &mut self,
        serial: u32,
        reply: &CreateServiceReply,
    ) -> Result<Vec<AdminAction>, AdminError> {
        let Some(Pending::UserService(index)) = self.pending.remove(&serial) else {
            tracing::warn!(serial, "create reply for unknown serial");
            return Ok(Vec::new());
        };

        self.acked += 1;
        let result = if reply.status == ServiceStatusCode::Running {
            Ok(reply.instance_id)
        } else {
            Err(AdminError::ServiceStartFailed(format!(
                "{} reported {:?}",
                self.user_services[index].name, reply.status
            )))
        };

        let mut actions = vec![AdminAction::UserService { index, result }];
        if self.acked == self.user_services.len() && !self.initialized_sent {
            self.initialized_sent = true;
            // Per-service failures stay per-service; initialization itself
            // completed once every request is acknowledged.
            actions.push(AdminAction::Initialized(Ok(())));
        }
        Ok(actions)
    }

    /// Keep-alive tick; the driver calls this every 120 s on the client.
    ///
    /// # Errors
    ///
    /// CBOR encoding failures only.
    pub fn tick(&mut self, now: Instant) -> Result<Vec<AdminAction>, AdminError> {
        if self.role != AdminRole::Client {
            return Ok(Vec::new());
        }

        if self.keepalive_outstanding >= KEEPALIVE_MISS_LIMIT {
            return Ok(vec![AdminAction::Teardown(AdminError::PeerTimeout)]);
        }

        self.keepalive_outstanding += 1;
        self.last_keepalive = Some(now);
        Ok(vec![AdminAction::Send(
            AdminPayload::Keepalive.into_message(SERIAL_KEEPALIVE)?,
        )])
    }

    /// Fiber teardown: complete every outstanding handler with
    /// `Cancelled` and report a final error for each user service.
    pub fn cancel_all(&mut self, reason: &AdminError) -> Vec<AdminAction> {
        let mut actions = Vec::new();

        let mut cancelled: Vec<usize> = self
            .pending
            .drain()
            .filter_map(|(_, pending)| match pending {
                Pending::UserService(index) => Some(index),
                _ => None,
            })
            .collect();
        cancelled.sort_unstable();

        for index in cancelled {
            actions.push(AdminAction::UserService { index, result: Err(AdminError::Cancelled) });
        }

        if !self.initialized_sent {
            self.initialized_sent = true;
            actions.push(AdminAction::Initialized(Err(reason.clone())));
        } else {
            // Services that did start get a final error too.
            for index in 0..self.user_services.len() {
                actions.push(AdminAction::UserService {
                    index,
                    result: Err(reason.clone()),
                });
            }
        }

        actions
    }

    /// Request stopping a remote instance.
    ///
    /// # Errors
    ///
    /// CBOR encoding failures only.
    pub fn request_stop(&mut self, instance_id: u32) -> Result<Vec<AdminAction>, AdminError> {
        let serial = self.alloc_serial();
        self.pending.insert(serial, Pending::Stop);
        let request =
            AdminPayload::StopService(ssf_proto::admin::StopService { instance_id });
        Ok(vec![AdminAction::Send(request.into_message(serial)?)])
    }

    /// Server: outcome of a `StartService` action.
    ///
    /// # Errors
    ///
    /// CBOR encoding failures only.
    pub fn local_create_done(
        &mut self,
        serial: u32,
        instance_id: u32,
        status: ServiceStatusCode,
    ) -> Result<Vec<AdminAction>, AdminError> {
        let reply = AdminPayload::CreateServiceReply(CreateServiceReply { instance_id, status });
        Ok(vec![AdminAction::Send(reply.into_message(serial)?)])
    }

    /// Server: outcome of a `StopService` action.
    ///
    /// # Errors
    ///
    /// CBOR encoding failures only.
    pub fn local_stop_done(
        &mut self,
        serial: u32,
        instance_id: u32,
        status: ServiceStatusCode,
    ) -> Result<Vec<AdminAction>, AdminError> {
        let reply = AdminPayload::StopServiceReply(StopServiceReply { instance_id, status });
        Ok(vec![AdminAction::Send(reply.into_message(serial)?)])
    }

    /// Server: outcome of a `QueryStatus` action.
    ///
    /// # Errors
    ///
    /// CBOR encoding failures only.
    pub fn local_status_done(
        &mut self,
        serial: u32,
        instance_id: u32,
        status: ServiceStatusCode,
    ) -> Result<Vec<AdminAction>, AdminError> {
        let reply = AdminPayload::ServiceStatusReply(ServiceStatusReply { instance_id, status });
        Ok(vec![AdminAction::Send(reply.into_message(serial)?)])
    }

    fn alloc_serial(&mut self) -> u32 {
        loop {
            let serial = self.next_serial;
            self.next_serial = self.next_serial.wrapping_add(2).max(match self.role {
                AdminRole::Client => SERIAL_CLIENT_BASE,
                AdminRole::Server => SERIAL_SERVER_BASE,
            });
            if !self.pending.contains_key(&serial) {
                return serial;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn specs(n: usize) -> Vec<UserServiceSpec> {
        (0..n)
            .map(|i| UserServiceSpec {
                name: format!("svc{i}"),
                factory_id: 7,
                parameters: BTreeMap::new(),
            })
            .collect()
    }

    fn sent(actions: &[AdminAction]) -> Vec<&AdminMessage> {
        actions
            .iter()
            .filter_map(|a| match a {
                AdminAction::Send(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn client_hello_uses_reserved_serial() {
        let mut client = AdminSession::client(specs(0));
        let actions = client.on_open().expect("open");
        let messages = sent(&actions);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].serial, SERIAL_HELLO);
    }

    #[test]
    fn hello_reply_triggers_create_requests_with_even_serials() {
        let mut client = AdminSession::client(specs(3));
        client.on_open().expect("open");

        let reply = AdminPayload::HelloReply(HelloReply { version: ADMIN_VERSION, capabilities: 0 })
            .into_message(SERIAL_HELLO)
            .expect("encode");
        let actions = client.handle_message(&reply).expect("handle");

        let messages = sent(&actions);
        assert_eq!(messages.len(), 3);
        for message in &messages {
            assert_eq!(message.serial % 2, 0, "client serials are even");
            assert!(message.serial >= SERIAL_CLIENT_BASE);
        }
        assert_eq!(client.pending_len(), 3);
    }

    #[test]
    fn create_replies_complete_exactly_once_then_initialize() {
        let mut client = AdminSession::client(specs(2));
        client.on_open().expect("open");
        let reply = AdminPayload::HelloReply(HelloReply { version: ADMIN_VERSION, capabilities: 0 })
            .into_message(SERIAL_HELLO)
            .expect("encode");
        let actions = client.handle_message(&reply).expect("handle");
        let serials: Vec<u32> = sent(&actions).iter().map(|m| m.serial).collect();

        let first = AdminPayload::CreateServiceReply(CreateServiceReply {
            instance_id: 10,
            status: ServiceStatusCode::Running,
        })
        .into_message(serials[0])
        .expect("encode");
        let actions = client.handle_message(&first).expect("handle");
        assert!(matches!(
            actions[0],
            AdminAction::UserService { index: 0, result: Ok(10) }
        ));
        assert_eq!(actions.len(), 1, "not initialized until all acked");
        assert_eq!(client.pending_len(), 1);

        // A duplicate reply for the same serial is dropped.
        let duplicate = client.handle_message(&first).expect("handle");
        assert!(duplicate.is_empty());

        let second = AdminPayload::CreateServiceReply(CreateServiceReply {
            instance_id: 0,
            status: ServiceStatusCode::Failed,
        })
        .into_message(serials[1])
        .expect("encode");
        let actions = client.handle_message(&second).expect("handle");
        assert!(matches!(
            actions[0],
            AdminAction::UserService { index: 1, result: Err(AdminError::ServiceStartFailed(_)) }
        ));
        assert!(matches!(actions[1], AdminAction::Initialized(Ok(()))));
        assert_eq!(client.pending_len(), 0);
    }

    #[test]
    fn server_echoes_keepalive_under_request_serial() {
        let mut server = AdminSession::server();
        let probe = AdminPayload::Keepalive.into_message(SERIAL_KEEPALIVE).expect("encode");
        let actions = server.handle_message(&probe).expect("handle");
        let messages = sent(&actions);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].serial, SERIAL_KEEPALIVE);
    }

    #[test]
    fn two_missed_keepalives_tear_down() {
        let mut client = AdminSession::client(specs(0));
        let t0 = Instant::now();

        let actions = client.tick(t0).expect("tick");
        assert_eq!(sent(&actions).len(), 1);

        let actions = client.tick(t0 + Duration::from_secs(120)).expect("tick");
        assert_eq!(sent(&actions).len(), 1);

        let actions = client.tick(t0 + Duration::from_secs(240)).expect("tick");
        assert!(matches!(actions[0], AdminAction::Teardown(AdminError::PeerTimeout)));
    }

    #[test]
    fn answered_keepalives_never_tear_down() {
        let mut client = AdminSession::client(specs(0));
        let mut now = Instant::now();

        for _ in 0..10 {
            let actions = client.tick(now).expect("tick");
            assert_eq!(sent(&actions).len(), 1, "probe sent");

            let echo = AdminPayload::Keepalive.into_message(SERIAL_KEEPALIVE).expect("encode");
            client.handle_message(&echo).expect("handle");
            now += Duration::from_secs(120);
        }
    }

    #[test]
    fn server_answers_hello_and_dispatches_create() {
        let mut server = AdminSession::server();

        let hello = AdminPayload::Hello(Hello { version: ADMIN_VERSION, capabilities: 0 })
            .into_message(SERIAL_HELLO)
            .expect("encode");
        let actions = server.handle_message(&hello).expect("handle");
        assert_eq!(sent(&actions)[0].serial, SERIAL_HELLO);

        let mut parameters = BTreeMap::new();
        parameters.insert("local_port".to_string(), "7".to_string());
        let create = AdminPayload::CreateService(CreateService { factory_id: 7, parameters })
            .into_message(4)
            .expect("encode");
        let actions = server.handle_message(&create).expect("handle");
        assert!(matches!(
            actions[0],
            AdminAction::StartService { serial: 4, factory_id: 7, .. }
        ));

        let actions = server
            .local_create_done(4, 1, ServiceStatusCode::Running)
            .expect("reply");
        assert_eq!(sent(&actions)[0].serial, 4);
    }

    #[test]
    fn version_mismatch_tears_down() {
        let mut server = AdminSession::server();
        let hello = AdminPayload::Hello(Hello { version: 99, capabilities: 0 })
            .into_message(SERIAL_HELLO)
            .expect("encode");
        let actions = server.handle_message(&hello).expect("handle");
        assert!(matches!(actions[0], AdminAction::Teardown(AdminError::Protocol(_))));
    }

    #[test]
    fn cancel_completes_outstanding_with_cancelled() {
        let mut client = AdminSession::client(specs(2));
        client.on_open().expect("open");
        let reply = AdminPayload::HelloReply(HelloReply { version: ADMIN_VERSION, capabilities: 0 })
            .into_message(SERIAL_HELLO)
            .expect("encode");
        client.handle_message(&reply).expect("handle");
        assert_eq!(client.pending_len(), 2);

        let actions = client.cancel_all(&AdminError::PeerTimeout);
        assert_eq!(client.pending_len(), 0);

        let user_errors = actions
            .iter()
            .filter(|a| {
                matches!(a, AdminAction::UserService { result: Err(AdminError::Cancelled), .. })
            })
            .count();
        assert_eq!(user_errors, 2);
        assert!(actions
            .iter()
            .any(|a| matches!(a, AdminAction::Initialized(Err(AdminError::PeerTimeout)))));
    }

    #[test]
    fn unknown_command_is_dropped() {
        let mut server = AdminSession::server();
        let message = AdminMessage {
            serial: 9,
            command_id: 0xFFFF_0000,
            payload: bytes::Bytes::new(),
        };
        let actions = server.handle_message(&message).expect("handle");
        assert!(actions.is_empty());
    }
}
