//! Random-input fuzzer for fiber frame decoding.
//!
//! Decoding untrusted bytes must never panic, and anything that decodes
//! must re-encode bit-identically.

#![no_main]

use libfuzzer_sys::fuzz_target;
use ssf_proto::FiberFrame;

fuzz_target!(|data: &[u8]| {
    if let Ok(frame) = FiberFrame::decode(data) {
        let mut wire = Vec::new();
        frame.encode(&mut wire);

        let reparsed = FiberFrame::decode(&wire).expect("re-decode of valid frame");
        assert_eq!(reparsed, frame, "decode/encode/decode must be identity");
    }
});
