//! Fiber wire-protocol exchanges over simulated TCP.

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use ssf_harness::{read_frame, write_frame, SimTransport};
use ssf_proto::{FiberFrame, FrameHeader, FrameType};

#[test]
fn syn_synack_data_fin_exchange() {
    let mut sim = turmoil::Builder::new().build();

    // Server: accept a fiber open on port 7, echo one data frame, answer
    // the FIN.
    sim.host("server", || async {
        let transport = SimTransport::bind("0.0.0.0:8011").await?;
        let mut stream = transport.accept().await?;

        let syn = read_frame(&mut stream).await?;
        assert_eq!(syn.frame_type(), Some(FrameType::StreamSyn));
        assert_eq!(syn.header.dst_port(), 7);
        let client_port = syn.header.src_port();

        write_frame(
            &mut stream,
            &FiberFrame::control(FrameType::StreamSynAck, 7, client_port),
        )
        .await?;

        let data = read_frame(&mut stream).await?;
        assert_eq!(data.frame_type(), Some(FrameType::StreamData));
        write_frame(
            &mut stream,
            &FiberFrame::new(
                FrameHeader::new(FrameType::StreamData, 7, client_port),
                data.payload.clone(),
            ),
        )
        .await?;

        let fin = read_frame(&mut stream).await?;
        assert_eq!(fin.frame_type(), Some(FrameType::StreamFin));
        write_frame(
            &mut stream,
            &FiberFrame::control(FrameType::StreamFin, 7, client_port),
        )
        .await?;

        Ok(())
    });

    sim.client("client", async {
        let mut stream = SimTransport::connect_to("server:8011").await?;
        let local_port = 49200;

        write_frame(
            &mut stream,
            &FiberFrame::control(FrameType::StreamSyn, local_port, 7),
        )
        .await?;

        let syn_ack = read_frame(&mut stream).await?;
        assert_eq!(syn_ack.frame_type(), Some(FrameType::StreamSynAck));
        assert_eq!(syn_ack.header.dst_port(), local_port);

        write_frame(
            &mut stream,
            &FiberFrame::new(
                FrameHeader::new(FrameType::StreamData, local_port, 7),
                Bytes::from_static(b"hello world"),
            ),
        )
        .await?;

        let echoed = read_frame(&mut stream).await?;
        assert_eq!(echoed.frame_type(), Some(FrameType::StreamData));
        assert_eq!(&echoed.payload[..], b"hello world");

        write_frame(
            &mut stream,
            &FiberFrame::control(FrameType::StreamFin, local_port, 7),
        )
        .await?;
        let fin = read_frame(&mut stream).await?;
        assert_eq!(fin.frame_type(), Some(FrameType::StreamFin));

        Ok(())
    });

    sim.run().expect("simulation should complete");
}

#[test]
fn corrupted_header_is_rejected_by_the_receiver() {
    let mut sim = turmoil::Builder::new().build();

    sim.host("server", || async {
        let transport = SimTransport::bind("0.0.0.0:8011").await?;
        let mut stream = transport.accept().await?;

        let err = read_frame(&mut stream).await.expect_err("corruption detected");
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        Ok(())
    });

    sim.client("client", async {
        let mut stream = SimTransport::connect_to("server:8011").await?;

        let frame = FiberFrame::new(
            FrameHeader::new(FrameType::StreamData, 49201, 7),
            Bytes::from_static(b"payload"),
        );
        let mut wire = Vec::new();
        frame.encode(&mut wire);
        wire[5] ^= 0xFF; // flip a source-port byte; the CRC must catch it

        stream.write_all(&wire).await?;
        // Give the server a chance to observe the failure before we
        // disappear.
        let mut sink = [0u8; 1];
        let _ = stream.read(&mut sink).await;
        Ok(())
    });

    sim.run().expect("simulation should complete");
}

#[test]
fn keepalive_round_trip() {
    let mut sim = turmoil::Builder::new().build();

    sim.host("server", || async {
        let transport = SimTransport::bind("0.0.0.0:8011").await?;
        let mut stream = transport.accept().await?;

        let probe = read_frame(&mut stream).await?;
        assert_eq!(probe.frame_type(), Some(FrameType::Keepalive));
        write_frame(&mut stream, &FiberFrame::control(FrameType::Keepalive, 0, 0)).await?;
        Ok(())
    });

    sim.client("client", async {
        let mut stream = SimTransport::connect_to("server:8011").await?;
        write_frame(&mut stream, &FiberFrame::control(FrameType::Keepalive, 0, 0)).await?;
        let echo = read_frame(&mut stream).await?;
        assert_eq!(echo.frame_type(), Some(FrameType::Keepalive));
        Ok(())
    });

    sim.run().expect("simulation should complete");
}
