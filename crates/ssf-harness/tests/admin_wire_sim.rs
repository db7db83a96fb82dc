//! Admin control-plane exchanges over simulated TCP.
//!
//! Both ends run the real [`AdminSession`] state machine; only the byte
//! transport and the service manager are simulated. This pins the wire
//! behavior (serials, command ids, CBOR payloads) end to end without the
//! production stack underneath.

use std::collections::BTreeMap;
use std::time::Instant;

use ssf_core::admin::{AdminAction, AdminSession, UserServiceSpec, ADMIN_VERSION};
use ssf_harness::{read_admin, write_admin, SimTransport};
use ssf_proto::{CommandId, ServiceStatusCode};

fn echo_spec() -> UserServiceSpec {
    let mut parameters = BTreeMap::new();
    parameters.insert("local_port".to_string(), "7".to_string());
    UserServiceSpec { name: "echo".to_string(), factory_id: 7, parameters }
}

#[test]
fn hello_create_keepalive_flow() {
    let mut sim = turmoil::Builder::new().build();

    // Server: real state machine, stub service manager that always
    // reports Running with instance id 41.
    sim.host("server", || async {
        let transport = SimTransport::bind("0.0.0.0:8011").await?;
        let mut stream = transport.accept().await?;
        let mut session = AdminSession::server();

        // Hello, CreateService, Keepalive.
        for _ in 0..3 {
            let message = read_admin(&mut stream).await?;
            let mut actions = session.handle_message(&message).expect("handle");

            while let Some(action) = actions.pop() {
                match action {
                    AdminAction::Send(reply) => write_admin(&mut stream, &reply).await?,
                    AdminAction::StartService { serial, factory_id, parameters } => {
                        assert_eq!(factory_id, 7);
                        assert_eq!(parameters.get("local_port").map(String::as_str), Some("7"));
                        actions.extend(
                            session
                                .local_create_done(serial, 41, ServiceStatusCode::Running)
                                .expect("reply"),
                        );
                    }
                    other => panic!("unexpected server action: {other:?}"),
                }
            }
        }
        Ok(())
    });

    sim.client("client", async {
        let mut stream = SimTransport::connect_to("server:8011").await?;
        let mut session = AdminSession::client(vec![echo_spec()]);

        // Hello out.
        for action in session.on_open().expect("open") {
            if let AdminAction::Send(message) = action {
                assert_eq!(message.serial, ssf_proto::admin::SERIAL_HELLO);
                write_admin(&mut stream, &message).await?;
            }
        }

        // HelloReply in → CreateService out.
        let reply = read_admin(&mut stream).await?;
        assert_eq!(reply.command(), Some(CommandId::HelloReply));
        let mut create_serial = 0;
        for action in session.handle_message(&reply).expect("handle") {
            if let AdminAction::Send(message) = action {
                assert_eq!(message.command(), Some(CommandId::CreateService));
                assert_eq!(message.serial % 2, 0, "client serials are even");
                create_serial = message.serial;
                write_admin(&mut stream, &message).await?;
            }
        }

        // CreateServiceReply in → service reported, session initialized.
        let reply = read_admin(&mut stream).await?;
        assert_eq!(reply.serial, create_serial);
        let actions = session.handle_message(&reply).expect("handle");
        assert!(actions.iter().any(|a| matches!(
            a,
            AdminAction::UserService { index: 0, result: Ok(41) }
        )));
        assert!(actions
            .iter()
            .any(|a| matches!(a, AdminAction::Initialized(Ok(())))));

        // Keepalive out, echo in.
        for action in session.tick(Instant::now()).expect("tick") {
            if let AdminAction::Send(message) = action {
                write_admin(&mut stream, &message).await?;
            }
        }
        let echo = read_admin(&mut stream).await?;
        assert_eq!(echo.command(), Some(CommandId::Keepalive));
        assert_eq!(echo.serial, ssf_proto::admin::SERIAL_KEEPALIVE);
        session.handle_message(&echo).expect("handle");

        Ok(())
    });

    sim.run().expect("simulation should complete");
}

#[test]
fn version_mismatch_is_fatal_on_the_wire() {
    let mut sim = turmoil::Builder::new().build();

    sim.host("server", || async {
        let transport = SimTransport::bind("0.0.0.0:8011").await?;
        let mut stream = transport.accept().await?;
        let mut session = AdminSession::server();

        let hello = read_admin(&mut stream).await?;
        let actions = session.handle_message(&hello).expect("handle");
        assert!(matches!(actions[0], AdminAction::Teardown(_)));
        Ok(())
    });

    sim.client("client", async {
        let mut stream = SimTransport::connect_to("server:8011").await?;

        // A future client speaking a version this server does not know.
        let message = ssf_proto::AdminPayload::Hello(ssf_proto::admin::Hello {
            version: ADMIN_VERSION + 1,
            capabilities: 0,
        })
        .into_message(ssf_proto::admin::SERIAL_HELLO)
        .expect("encode");
        write_admin(&mut stream, &message).await?;
        Ok(())
    });

    sim.run().expect("simulation should complete");
}
