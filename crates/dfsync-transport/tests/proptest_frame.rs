//! Property-based tests for frame header decoding.

use dfsync_transport::{Frame, FrameFlags, FrameHeader, Opcode, TransportError, FRAME_HEADER_SIZE};
use proptest::prelude::*;

fn opcode_strategy() -> impl Strategy<Value = Opcode> {
    prop_oneof![
        Just(Opcode::AcquireWriteLock),
        Just(Opcode::WriteFile),
        Just(Opcode::GetFile),
        Just(Opcode::DeleteFile),
        Just(Opcode::ListFiles),
        Just(Opcode::GetFileStatus),
        Just(Opcode::CallbackList),
        Just(Opcode::Cancel),
    ]
}

proptest! {
    /// Test: every encodable header decodes to itself.
    #[test]
    fn test_header_decodes_to_itself(
        opcode in opcode_strategy(),
        request_id in any::<u64>(),
        flags in 0u8..8,
        payload in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        let frame = Frame::new(opcode, request_id, FrameFlags::from_u8(flags), payload);
        let decoded = FrameHeader::decode(&frame.header.encode()).unwrap();
        prop_assert_eq!(decoded, frame.header);
        prop_assert!(frame.validate().is_ok());
    }

    /// Test: arbitrary bytes never panic the decoder.
    #[test]
    fn test_decode_arbitrary_bytes(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
        let _ = FrameHeader::decode(&bytes);
    }

    /// Test: flipping a payload byte is caught by the frame checksum.
    #[test]
    fn test_payload_corruption_detected(
        payload in proptest::collection::vec(any::<u8>(), 1..256),
        index in any::<usize>(),
        mask in 1u8..=255,
    ) {
        let mut frame = Frame::new(Opcode::GetFile, 1, FrameFlags::DATA, payload);
        let i = index % frame.payload.len();
        frame.payload[i] ^= mask;
        let is_mismatch = matches!(frame.validate(), Err(TransportError::ChecksumMismatch { .. }));
        prop_assert!(is_mismatch);
    }

    /// Test: headers shorter than the fixed size are rejected.
    #[test]
    fn test_short_headers_rejected(len in 0usize..FRAME_HEADER_SIZE) {
        let bytes = vec![0u8; len];
        let is_invalid = matches!(FrameHeader::decode(&bytes), Err(TransportError::InvalidFrame { .. }));
        prop_assert!(is_invalid);
    }
}
