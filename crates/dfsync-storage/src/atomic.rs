//! Temp-file-plus-rename writes into a mount directory.
//!
//! Content is streamed into a hidden sibling (`.<name>.dfsync-part`) and only
//! renamed over the target on [`AtomicFile::commit`]. Readers and directory
//! watchers never see a half-written target, and the temp name is hidden, so
//! watchers that ignore dot-files never react to it.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::StorageResult;
use crate::record::{resolve, touch_mtime};

const PART_SUFFIX: &str = ".dfsync-part";

/// True for the temp names [`AtomicFile`] writes into.
pub fn is_part_file(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(PART_SUFFIX)
}

/// A pending write that becomes visible only once committed.
pub struct AtomicFile {
    file: Option<tokio::fs::File>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    written: u64,
    committed: bool,
}

impl AtomicFile {
    /// Creates (truncating) the temp file for `name` under `root`.
    pub async fn create(root: &Path, name: &str) -> StorageResult<Self> {
        let final_path = resolve(root, name)?;
        let tmp_path = root.join(format!(".{}{}", name, PART_SUFFIX));
        let file = tokio::fs::File::create(&tmp_path).await?;
        Ok(Self {
            file: Some(file),
            tmp_path,
            final_path,
            written: 0,
            committed: false,
        })
    }

    /// Appends a chunk.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> StorageResult<()> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(chunk).await?;
            self.written += chunk.len() as u64;
        }
        Ok(())
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flushes, renames over the target, and optionally stamps its mtime.
    ///
    /// On any error before the rename lands the temp file is removed.
    pub async fn commit(mut self, mtime: Option<i64>) -> StorageResult<u64> {
        if let Some(file) = self.file.as_mut() {
            file.flush().await?;
            file.sync_all().await?;
        }
        // Close the handle before the rename.
        self.file = None;
        tokio::fs::rename(&self.tmp_path, &self.final_path).await?;
        self.committed = true;
        if let Some(secs) = mtime {
            touch_mtime(&self.final_path, secs).await?;
        }
        debug!(path = %self.final_path.display(), bytes = self.written, "committed atomic write");
        Ok(self.written)
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = std::fs::remove_file(&self.tmp_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.tmp_path.display(), error = %e, "failed to remove partial file");
                }
            }
        }
    }
}
