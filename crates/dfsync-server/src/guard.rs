//! Per-file and directory-wide reader/writer guards.
//!
//! Lock order: the directory guard is always taken before any file guard,
//! and no operation holds more than one file guard. Guards are owned tokio
//! guards, so they survive across stream I/O and are released on drop.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Shared access to one file's bytes.
pub type FileReadGuard = OwnedRwLockReadGuard<()>;
/// Exclusive access to one file's bytes.
pub type FileWriteGuard = OwnedRwLockWriteGuard<()>;

/// Lazily created file guards plus the single directory guard.
#[derive(Debug, Default)]
pub struct GuardSet {
    files: DashMap<String, Arc<RwLock<()>>>,
    directory: Arc<RwLock<()>>,
}

impl GuardSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// The guard for `name`, created on first reference and kept forever.
    pub fn guard(&self, name: &str) -> Arc<RwLock<()>> {
        if let Some(existing) = self.files.get(name) {
            return existing.value().clone();
        }
        self.files
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .value()
            .clone()
    }

    /// Takes the file guard for `name` shared.
    pub async fn file_shared(&self, name: &str) -> FileReadGuard {
        self.guard(name).read_owned().await
    }

    /// Takes the file guard for `name` exclusively.
    pub async fn file_exclusive(&self, name: &str) -> FileWriteGuard {
        self.guard(name).write_owned().await
    }

    /// Takes the directory guard shared.
    pub async fn directory_shared(&self) -> OwnedRwLockReadGuard<()> {
        self.directory.clone().read_owned().await
    }

    /// Takes the directory guard exclusively.
    pub async fn directory_exclusive(&self) -> OwnedRwLockWriteGuard<()> {
        self.directory.clone().write_owned().await
    }

    /// Number of file guards created so far.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True if no file guard exists yet.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
