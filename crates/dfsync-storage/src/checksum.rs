//! Content fingerprints for conflict resolution.
//!
//! A CRC-32 (IEEE polynomial, table driven) over the whole file, fed in
//! fixed-size chunks in file order. The value only detects accidental
//! divergence between cooperating clients; it is not collision resistant.

use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::error::StorageResult;

/// Chunk size used when reading content into the checksum engine.
pub const CHECKSUM_CHUNK_SIZE: usize = 4096;

/// A computed CRC-32 content checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum(u32);

impl Checksum {
    /// Wraps a raw checksum value.
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw checksum value.
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Rolling checksum state. Feeding the same bytes in the same order always
/// yields the same value, regardless of how they are split into updates.
#[derive(Clone, Default)]
pub struct ChecksumEngine {
    hasher: crc32fast::Hasher,
    bytes: u64,
}

impl ChecksumEngine {
    /// Creates an engine with no bytes consumed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the next chunk of content.
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Number of bytes consumed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Returns the checksum of everything fed so far.
    pub fn finalize(self) -> Checksum {
        Checksum(self.hasher.finalize())
    }
}

/// Checksums an in-memory buffer, chunk by chunk.
pub fn checksum_bytes(data: &[u8]) -> Checksum {
    let mut engine = ChecksumEngine::new();
    for chunk in data.chunks(CHECKSUM_CHUNK_SIZE) {
        engine.update(chunk);
    }
    engine.finalize()
}

/// Checksums everything a reader yields.
pub fn checksum_reader<R: Read>(mut reader: R) -> std::io::Result<Checksum> {
    let mut engine = ChecksumEngine::new();
    let mut buf = [0u8; CHECKSUM_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        engine.update(&buf[..n]);
    }
    Ok(engine.finalize())
}

/// Checksums the file at `path`.
///
/// Returns `Ok(None)` when the file does not exist, so a missing file never
/// compares equal to any client checksum (including that of empty content).
pub async fn file_checksum(path: &Path) -> StorageResult<Option<Checksum>> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut engine = ChecksumEngine::new();
    let mut buf = vec![0u8; CHECKSUM_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        engine.update(&buf[..n]);
    }

    let size = engine.bytes();
    let checksum = engine.finalize();
    debug!(path = %path.display(), size, checksum = %checksum, "computed file checksum");
    Ok(Some(checksum))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_known_value() {
        // CRC-32/ISO-HDLC check value
        assert_eq!(checksum_bytes(b"123456789").value(), 0xCBF43926);
    }

    #[test]
    fn test_empty_content_is_zero() {
        assert_eq!(checksum_bytes(&[]).value(), 0);
    }

    #[test]
    fn test_split_updates_match_single_update() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut engine = ChecksumEngine::new();
        engine.update(&data[..17]);
        engine.update(&data[17..5000]);
        engine.update(&data[5000..]);
        assert_eq!(engine.bytes(), 10_000);
        assert_eq!(engine.finalize(), checksum_bytes(&data));
    }

    #[test]
    fn test_single_byte_change_detected() {
        let mut data = vec![7u8; 9000];
        let before = checksum_bytes(&data);
        data[8999] = 8;
        assert_ne!(before, checksum_bytes(&data));
    }

    #[test]
    fn test_reader_matches_bytes() {
        let data = b"the quick brown fox".repeat(500);
        let from_reader = checksum_reader(&data[..]).unwrap();
        assert_eq!(from_reader, checksum_bytes(&data));
    }

    #[test]
    fn test_display_is_hex() {
        assert_eq!(Checksum::new(0xAB).to_string(), "000000ab");
    }

    #[tokio::test]
    async fn test_file_checksum_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = file_checksum(&dir.path().join("absent.txt")).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_file_checksum_matches_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        let data = vec![42u8; CHECKSUM_CHUNK_SIZE * 3 + 11];
        std::fs::File::create(&path).unwrap().write_all(&data).unwrap();

        let result = file_checksum(&path).await.unwrap();
        assert_eq!(result, Some(checksum_bytes(&data)));
    }

    #[tokio::test]
    async fn test_file_checksum_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.txt");
        std::fs::File::create(&path).unwrap();
        assert_eq!(file_checksum(&path).await.unwrap(), Some(Checksum::new(0)));
    }
}
