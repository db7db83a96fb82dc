//! Fiber frame combining header and payload.

use bytes::{BufMut, Bytes};

use crate::{
    errors::{ProtocolError, Result},
    fiber::{FrameHeader, FrameType},
};

/// Complete fiber frame.
///
/// Wire layout: `[FrameHeader: 16 bytes] + [payload: payload_len bytes]`.
///
/// # Invariants
///
/// - `payload.len()` always matches `header.payload_len()`; enforced by
///   [`FiberFrame::new`] and verified by [`FiberFrame::decode`].
/// - The header checksum covers the header with a sealed payload length, so
///   a frame constructed here always re-encodes bit-identically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiberFrame {
    /// Frame header (16 bytes)
    pub header: FrameHeader,
    /// Raw payload bytes
    pub payload: Bytes,
}

impl FiberFrame {
    /// Create a frame, sealing the payload length and checksum into the
    /// header.
    ///
    /// # Panics
    ///
    /// Panics if `payload.len()` exceeds
    /// [`FrameHeader::MAX_PAYLOAD_LEN`]; the demultiplexer fragments stream
    /// data to its MTU before frames are built, so this is a caller bug.
    #[must_use]
    pub fn new(mut header: FrameHeader, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        assert!(
            payload.len() <= FrameHeader::MAX_PAYLOAD_LEN,
            "fiber frame payload exceeds u16 length field"
        );

        #[allow(clippy::cast_possible_truncation)]
        {
            header.payload_len = (payload.len() as u16).to_le_bytes();
        }
        header.seal();

        Self { header, payload }
    }

    /// Convenience constructor for a control frame with no payload.
    #[must_use]
    pub fn control(frame_type: FrameType, src_port: u32, dst_port: u32) -> Self {
        Self::new(FrameHeader::new(frame_type, src_port, dst_port), Bytes::new())
    }

    /// Encode the frame into a buffer.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_slice(&self.header.to_bytes());
        dst.put_slice(&self.payload);
    }

    /// Total encoded size in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        FrameHeader::SIZE + self.payload.len()
    }

    /// Decode a frame from wire bytes.
    ///
    /// Header validation (including the CRC) happens before any payload
    /// allocation. Only `payload_len` bytes are consumed; trailing data is
    /// left for the next frame.
    ///
    /// # Errors
    ///
    /// Header errors from [`FrameHeader::from_bytes`], or
    /// [`ProtocolError::FrameTruncated`] when the buffer holds fewer payload
    /// bytes than the header claims.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = FrameHeader::from_bytes(bytes)?;

        let payload_len = header.payload_len() as usize;
        let total = FrameHeader::SIZE + payload_len;

        if bytes.len() < total {
            return Err(ProtocolError::FrameTruncated {
                expected: payload_len,
                actual: bytes.len().saturating_sub(FrameHeader::SIZE),
            });
        }

        let payload = Bytes::copy_from_slice(&bytes[FrameHeader::SIZE..total]);

        Ok(Self { header: *header, payload })
    }

    /// Frame type; `None` never survives [`decode`](Self::decode).
    #[must_use]
    pub fn frame_type(&self) -> Option<FrameType> {
        self.header.frame_type()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    impl Arbitrary for FiberFrame {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
            (any::<FrameHeader>(), prop::collection::vec(any::<u8>(), 0..2048))
                .prop_map(|(header, payload)| FiberFrame::new(header, payload))
                .boxed()
        }
    }

    proptest! {
        #[test]
        fn frame_round_trip(frame in any::<FiberFrame>()) {
            let mut wire = Vec::new();
            frame.encode(&mut wire);
            prop_assert_eq!(wire.len(), frame.encoded_len());

            let parsed = FiberFrame::decode(&wire).expect("should decode");
            prop_assert_eq!(frame, parsed);
        }
    }

    #[test]
    fn data_frame_round_trip() {
        let frame = FiberFrame::new(
            FrameHeader::new(FrameType::StreamData, 49160, 7),
            &b"hello world"[..],
        );
        assert_eq!(frame.header.payload_len(), 11);

        let mut wire = Vec::new();
        frame.encode(&mut wire);
        let parsed = FiberFrame::decode(&wire).expect("should decode");
        assert_eq!(parsed.header.src_port(), 49160);
        assert_eq!(parsed.header.dst_port(), 7);
        assert_eq!(&parsed.payload[..], b"hello world");
    }

    #[test]
    fn trailing_bytes_left_alone() {
        let frame = FiberFrame::control(FrameType::StreamFin, 3, 4);
        let mut wire = Vec::new();
        frame.encode(&mut wire);
        wire.extend_from_slice(b"next frame bytes");

        let parsed = FiberFrame::decode(&wire).expect("should decode");
        assert_eq!(parsed.payload.len(), 0);
    }

    #[test]
    fn reject_truncated_frame() {
        let frame = FiberFrame::new(
            FrameHeader::new(FrameType::StreamData, 1, 2),
            vec![0u8; 100],
        );
        let mut wire = Vec::new();
        frame.encode(&mut wire);

        let result = FiberFrame::decode(&wire[..FrameHeader::SIZE + 10]);
        assert_eq!(
            result,
            Err(ProtocolError::FrameTruncated { expected: 100, actual: 10 })
        );
    }
}
