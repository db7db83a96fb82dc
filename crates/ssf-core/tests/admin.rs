//! Admin control plane scenarios over an in-memory stream pair.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use ssf_core::admin::{
    self, AdminEvent, AdminSession, UserServiceSpec, ADMIN_PORT,
};
use ssf_core::demux::FiberDemux;
use ssf_core::error::AdminError;
use ssf_core::services::{ServiceManager, ServiceRegistry, ECHO_FACTORY_ID};
use ssf_proto::admin::AdminHeader;
use ssf_proto::{AdminMessage, AdminPayload, CommandId};

fn demux_pair() -> (Arc<FiberDemux>, Arc<FiberDemux>) {
    let (near, far) = tokio::io::duplex(256 * 1024);
    (
        Arc::new(FiberDemux::new(near, 65535)),
        Arc::new(FiberDemux::new(far, 65535)),
    )
}

fn echo_spec(port: u32) -> UserServiceSpec {
    let mut parameters = BTreeMap::new();
    parameters.insert("local_port".to_string(), port.to_string());
    UserServiceSpec {
        name: "echo".to_string(),
        factory_id: ECHO_FACTORY_ID,
        parameters,
    }
}

#[tokio::test]
async fn client_requests_services_and_initializes() {
    let (client_demux, server_demux) = demux_pair();

    let manager = Arc::new(ServiceManager::new(
        ServiceRegistry::with_builtin(),
        Arc::clone(&server_demux),
    ));
    let _server = admin::start_server(Arc::clone(&server_demux), Arc::clone(&manager))
        .expect("admin server");

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let _client = admin::start_client(
        Arc::clone(&client_demux),
        vec![echo_spec(9)],
        events_tx,
    )
    .await
    .expect("admin client");

    let mut saw_service = false;
    let mut saw_initialized = false;
    while !(saw_service && saw_initialized) {
        match events.recv().await.expect("event") {
            AdminEvent::UserService { name, result } => {
                assert_eq!(name, "echo");
                assert!(result.expect("service should start") > 0);
                saw_service = true;
            }
            AdminEvent::Initialized(result) => {
                result.expect("initialization should succeed");
                saw_initialized = true;
            }
            AdminEvent::Closed(reason) => panic!("unexpected close: {reason}"),
        }
    }
    assert_eq!(manager.count(), 1);

    // The requested echo service is actually reachable over a new fiber.
    let mut fiber = client_demux.connect(9).await.expect("echo fiber");
    fiber.write_all(b"ping").await.expect("write");
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        let n = fiber.read(&mut buf[filled..]).await.expect("read");
        assert!(n > 0);
        filled += n;
    }
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn failed_service_is_reported_per_service() {
    let (client_demux, server_demux) = demux_pair();

    // Empty registry: the server cannot start anything.
    let manager = Arc::new(ServiceManager::new(
        ServiceRegistry::new(),
        Arc::clone(&server_demux),
    ));
    let _server = admin::start_server(Arc::clone(&server_demux), manager).expect("admin server");

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let _client =
        admin::start_client(Arc::clone(&client_demux), vec![echo_spec(9)], events_tx)
            .await
            .expect("admin client");

    let mut saw_failure = false;
    let mut saw_initialized = false;
    while !(saw_failure && saw_initialized) {
        match events.recv().await.expect("event") {
            AdminEvent::UserService { result, .. } => {
                assert!(matches!(result, Err(AdminError::ServiceStartFailed(_))));
                saw_failure = true;
            }
            // A per-service failure does not fail initialization.
            AdminEvent::Initialized(result) => {
                result.expect("initialization still completes");
                saw_initialized = true;
            }
            AdminEvent::Closed(reason) => panic!("unexpected close: {reason}"),
        }
    }
}

#[tokio::test]
async fn no_admin_acceptor_means_unreachable() {
    // Server demux exists but never binds the admin port; keep retries
    // fast by pausing time (sleeps auto-advance).
    tokio::time::pause();

    let (client_demux, _server_demux) = demux_pair();
    let (events_tx, _events) = mpsc::unbounded_channel();

    let err = admin::start_client(Arc::clone(&client_demux), Vec::new(), events_tx)
        .await
        .expect_err("no acceptor");
    assert!(matches!(err, AdminError::AdminUnreachable { attempts: 50 }));
}

#[tokio::test(start_paused = true)]
async fn silent_server_times_out_after_two_missed_keepalives() {
    let (client_demux, server_demux) = demux_pair();

    // A server that answers hello but never echoes keep-alives.
    let muted_server = {
        let demux = Arc::clone(&server_demux);
        tokio::spawn(async move {
            let mut listener = demux.listen(ADMIN_PORT).expect("listen");
            let fiber = listener.accept().await.expect("accept");
            let (mut reader, mut writer) = fiber.split();
            let mut session = AdminSession::server();

            loop {
                let mut header_buf = [0u8; AdminHeader::SIZE];
                if reader.read_exact(&mut header_buf).await.is_err() {
                    return;
                }
                let header = *AdminHeader::from_bytes(&header_buf).expect("header");
                let mut payload = vec![0u8; header.payload_len() as usize];
                if !payload.is_empty() {
                    reader.read_exact(&mut payload).await.expect("payload");
                }
                let message = AdminMessage {
                    serial: header.serial(),
                    command_id: header.command_id(),
                    payload: payload.into(),
                };

                for action in session.handle_message(&message).expect("handle") {
                    if let admin::AdminAction::Send(reply) = action {
                        if reply.command() == Some(CommandId::Keepalive) {
                            continue; // swallow the echo
                        }
                        let mut buf = Vec::new();
                        reply.encode(&mut buf).expect("encode");
                        if writer.write_all(&buf).await.is_err() {
                            return;
                        }
                    }
                }
            }
        })
    };

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let _client = admin::start_client(Arc::clone(&client_demux), Vec::new(), events_tx)
        .await
        .expect("admin client");

    let started = tokio::time::Instant::now();
    loop {
        match events.recv().await.expect("event") {
            AdminEvent::Initialized(result) => result.expect("initialized"),
            AdminEvent::UserService { .. } => {}
            AdminEvent::Closed(reason) => {
                assert_eq!(reason, AdminError::PeerTimeout);
                break;
            }
        }
    }

    // Two whole keep-alive periods must have elapsed (virtual time).
    let elapsed = started.elapsed();
    assert!(
        elapsed >= std::time::Duration::from_secs(240),
        "tore down after only {elapsed:?}"
    );

    // The timeout tears the whole connection down.
    let err = client_demux.connect(77).await.expect_err("demux closed");
    assert!(matches!(
        err,
        ssf_core::error::DemuxError::Aborted | ssf_core::error::DemuxError::AlreadyClosed
    ));

    muted_server.abort();
}

#[tokio::test]
async fn keepalive_payload_round_trip_on_the_wire() {
    // The reserved keep-alive serial and empty payload survive the full
    // encode → demux → decode path.
    let (client_demux, server_demux) = demux_pair();

    let mut listener = server_demux.listen(ADMIN_PORT).expect("listen");
    let mut client_fiber = client_demux.connect(ADMIN_PORT).await.expect("connect");
    let accepted = listener.accept().await.expect("accept");
    let (mut reader, _writer) = accepted.split();

    let probe = AdminPayload::Keepalive
        .into_message(ssf_proto::admin::SERIAL_KEEPALIVE)
        .expect("encode");
    let mut wire = Vec::new();
    probe.encode(&mut wire).expect("frame");
    client_fiber.write_all(&wire).await.expect("write");

    let mut header_buf = [0u8; AdminHeader::SIZE];
    reader.read_exact(&mut header_buf).await.expect("read");
    let header = *AdminHeader::from_bytes(&header_buf).expect("header");
    assert_eq!(header.serial(), ssf_proto::admin::SERIAL_KEEPALIVE);
    assert_eq!(header.command_id(), CommandId::Keepalive.to_u32());
    assert_eq!(header.payload_len(), 0);
}
