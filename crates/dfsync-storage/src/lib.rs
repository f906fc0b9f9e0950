#![warn(missing_docs)]

//! dfsync storage subsystem: content checksums, file records, atomic local writes
//!
//! Both the server and the client sync daemon work against a flat directory of
//! regular files. This crate holds the pieces they share: the CRC-32 checksum
//! engine used for conflict resolution, on-demand [`FileRecord`] derivation,
//! and the temp-file-plus-rename writer used when fetched content lands on disk.

pub mod atomic;
pub mod checksum;
pub mod error;
pub mod record;

pub use atomic::{is_part_file, AtomicFile};
pub use checksum::{checksum_bytes, checksum_reader, file_checksum, Checksum, ChecksumEngine, CHECKSUM_CHUNK_SIZE};
pub use error::{StorageError, StorageResult};
pub use record::{resolve, scan, stat, touch_mtime, validate_name, FileRecord};
