//! On-demand file records.
//!
//! Nothing here is cached: every stat, scan, or verification reads the
//! filesystem again, so a record is only as old as the RPC that built it.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::atomic::is_part_file;
use crate::checksum::{file_checksum, Checksum};
use crate::error::{StorageError, StorageResult};

/// Size and timestamps of one regular file in a mount directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Filename relative to the mount directory.
    pub name: String,
    /// Absolute path on disk.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// Creation time, seconds since the UNIX epoch.
    pub created: i64,
    /// Modification time, seconds since the UNIX epoch.
    pub modified: i64,
}

impl FileRecord {
    fn from_metadata(name: String, path: PathBuf, meta: &std::fs::Metadata) -> Self {
        let modified = meta.modified().map(epoch_secs).unwrap_or_default();
        Self {
            name,
            path,
            size: meta.len(),
            created: created_secs(meta).unwrap_or(modified),
            modified,
        }
    }

    /// Computes the content checksum now. `None` if the file vanished.
    pub async fn checksum(&self) -> StorageResult<Option<Checksum>> {
        file_checksum(&self.path).await
    }
}

fn epoch_secs(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

#[cfg(unix)]
fn created_secs(meta: &std::fs::Metadata) -> Option<i64> {
    use std::os::unix::fs::MetadataExt;
    meta.created().map(epoch_secs).ok().or(Some(meta.ctime()))
}

#[cfg(not(unix))]
fn created_secs(meta: &std::fs::Metadata) -> Option<i64> {
    meta.created().map(epoch_secs).ok()
}

/// Rejects names that would escape a flat mount directory.
pub fn validate_name(name: &str) -> StorageResult<()> {
    let reason = if name.is_empty() {
        "empty name"
    } else if name == "." || name == ".." {
        "refers to a directory"
    } else if name.contains('/') || name.contains('\\') {
        "contains a path separator"
    } else if name.contains('\0') {
        "contains a NUL byte"
    } else {
        return Ok(());
    };
    Err(StorageError::InvalidName {
        name: name.to_string(),
        reason,
    })
}

/// Joins a validated name onto the mount directory.
pub fn resolve(root: &Path, name: &str) -> StorageResult<PathBuf> {
    validate_name(name)?;
    Ok(root.join(name))
}

/// Stats one file. `Ok(None)` if it does not exist.
pub async fn stat(root: &Path, name: &str) -> StorageResult<Option<FileRecord>> {
    let path = resolve(root, name)?;
    let meta = match tokio::fs::metadata(&path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if !meta.is_file() {
        return Err(StorageError::NotRegularFile {
            name: name.to_string(),
        });
    }
    Ok(Some(FileRecord::from_metadata(name.to_string(), path, &meta)))
}

/// Lists every regular file directly under `root`, sorted by name.
///
/// A missing directory yields an empty listing. Entries that disappear between
/// the directory read and their stat are skipped, as are in-progress writes.
pub async fn scan(root: &Path) -> StorageResult<Vec<FileRecord>> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(root = %root.display(), "mount directory missing, returning empty listing");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = match entry.file_name().into_string() {
            Ok(n) => n,
            Err(raw) => {
                debug!(name = ?raw, "skipping non UTF-8 entry");
                continue;
            }
        };
        if is_part_file(&name) {
            continue;
        }
        let path = entry.path();
        let meta = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        if !meta.is_file() {
            debug!(path = %path.display(), "found non-regular entry, skipping");
            continue;
        }
        records.push(FileRecord::from_metadata(name, path, &meta));
    }
    records.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(records)
}

/// Sets the modification time of `path` to `secs` since the UNIX epoch.
pub async fn touch_mtime(path: &Path, secs: i64) -> StorageResult<()> {
    let path = path.to_path_buf();
    let when = if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    };
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.set_modified(when)
    })
    .await
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
    Ok(())
}
