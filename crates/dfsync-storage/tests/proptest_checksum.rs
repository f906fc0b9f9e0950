//! Property-based tests for the checksum engine.

use dfsync_storage::{checksum_bytes, checksum_reader, ChecksumEngine};
use proptest::prelude::*;

proptest! {
    /// Test: any split of the content into updates yields the whole-content checksum.
    #[test]
    fn test_chunking_does_not_change_checksum(
        data in proptest::collection::vec(any::<u8>(), 0..20_000),
        cuts in proptest::collection::vec(any::<usize>(), 0..8),
    ) {
        let mut points: Vec<usize> = cuts.iter().map(|c| if data.is_empty() { 0 } else { c % data.len() }).collect();
        points.sort_unstable();

        let mut engine = ChecksumEngine::new();
        let mut start = 0;
        for p in points {
            engine.update(&data[start..p]);
            start = p;
        }
        engine.update(&data[start..]);

        prop_assert_eq!(engine.bytes(), data.len() as u64);
        prop_assert_eq!(engine.finalize().value(), crc32fast::hash(&data));
    }

    /// Test: reading from a stream gives the same value as hashing the buffer.
    #[test]
    fn test_reader_agrees_with_buffer(data in proptest::collection::vec(any::<u8>(), 0..50_000)) {
        let from_reader = checksum_reader(&data[..]).unwrap();
        prop_assert_eq!(from_reader, checksum_bytes(&data));
    }
}
