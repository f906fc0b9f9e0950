//! The sync daemon: a local watcher and a remote poller feeding one applier.
//!
//! Both producers only ever push [`SyncEvent`]s into the queue. The applier
//! owns the [`ClientSnapshot`] and applies events strictly one at a time, so
//! a store and a fetch of the same file never overlap within one daemon.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dfsync_storage::{scan, stat, FileRecord};
use dfsync_transport::{FileList, FileStatus, StatusCode};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::node::{ClientNode, FetchOutcome, StoreOutcome};
use crate::watch::{LocalChange, LocalWatcher, NameFilter};

const QUEUE_DEPTH: usize = 1024;
const STORE_ATTEMPTS: u32 = 3;
const STORE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// One unit of work for the applier.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A local file appeared or changed.
    Store(String),
    /// A local file disappeared.
    Delete(String),
    /// A fresh server listing from the poller.
    Listing(FileList),
}

impl From<LocalChange> for SyncEvent {
    fn from(change: LocalChange) -> Self {
        match change {
            LocalChange::Store(name) => SyncEvent::Store(name),
            LocalChange::Delete(name) => SyncEvent::Delete(name),
        }
    }
}

/// Modified time and size of one file as the server last reported it.
///
/// Mtimes have whole-second resolution; the size catches most same-second
/// rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    /// Seconds since the epoch.
    pub modified: i64,
    /// Bytes.
    pub size: u64,
}

impl FileStamp {
    /// Stamp of a file on disk.
    pub fn of_local(record: &FileRecord) -> Self {
        Self {
            modified: record.modified,
            size: record.size,
        }
    }
}

impl From<&FileStatus> for FileStamp {
    fn from(status: &FileStatus) -> Self {
        Self {
            modified: status.modified,
            size: status.size,
        }
    }
}

/// Result of diffing a listing against the snapshot.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    /// New on the server, or with a different stamp.
    pub changed: Vec<String>,
    /// Known before, absent from the listing.
    pub removed: Vec<String>,
}

/// Last-known server stamp per file.
#[derive(Debug, Clone, Default)]
pub struct ClientSnapshot {
    entries: HashMap<String, FileStamp>,
}

impl ClientSnapshot {
    /// Snapshot of a listing.
    pub fn from_listing(listing: &FileList) -> Self {
        let mut snapshot = Self::default();
        snapshot.replace(listing);
        snapshot
    }

    /// Entries to fetch and local copies to remove. Both lists are sorted.
    pub fn diff(&self, listing: &FileList) -> SnapshotDiff {
        let mut changed: Vec<String> = listing
            .files
            .iter()
            .filter(|f| self.entries.get(&f.name) != Some(&FileStamp::from(*f)))
            .map(|f| f.name.clone())
            .collect();
        let mut removed: Vec<String> = self
            .entries
            .keys()
            .filter(|name| !listing.files.iter().any(|f| &f.name == *name))
            .cloned()
            .collect();
        changed.sort();
        removed.sort();
        SnapshotDiff { changed, removed }
    }

    /// Forgets everything and takes the listing's entries.
    pub fn replace(&mut self, listing: &FileList) {
        self.entries = listing
            .files
            .iter()
            .map(|f| (f.name.clone(), FileStamp::from(f)))
            .collect();
    }

    /// Remembers a stamp the server acknowledged.
    pub fn record(&mut self, name: &str, stamp: FileStamp) {
        self.entries.insert(name.to_string(), stamp);
    }

    /// Drops one entry.
    pub fn forget(&mut self, name: &str) {
        self.entries.remove(name);
    }

    /// Puts back whatever `previous` knew about `name`, so the next diff
    /// reports it again.
    pub fn restore(&mut self, name: &str, previous: &ClientSnapshot) {
        match previous.get(name) {
            Some(stamp) => self.record(name, stamp),
            None => self.forget(name),
        }
    }

    /// Known stamp of `name`.
    pub fn get(&self, name: &str) -> Option<FileStamp> {
        self.entries.get(name).copied()
    }

    /// True if `name` has an entry.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True with no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A mounted directory kept in sync with the server.
pub struct Daemon {
    token: CancellationToken,
    watcher: Option<LocalWatcher>,
    poller: Option<JoinHandle<()>>,
    applier: Option<JoinHandle<()>>,
}

impl Daemon {
    /// Reconciles once, then starts the watcher, the poller and the applier.
    pub async fn mount(node: Arc<ClientNode>, config: &ClientConfig) -> ClientResult<Self> {
        let root = node.mount_path().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        let filter = NameFilter::new(&config.extensions);

        let snapshot = reconcile(&node, &filter).await?;
        info!(path = %root.display(), files = snapshot.len(), "initial reconciliation complete");

        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel::<SyncEvent>(QUEUE_DEPTH);

        let watcher = LocalWatcher::spawn(root.clone(), filter, tx.clone(), token.child_token())?;
        let poller = tokio::spawn(poll(
            node.clone(),
            Duration::from_millis(config.poll_interval_ms.max(1)),
            tx,
            token.child_token(),
        ));
        let applier = tokio::spawn(apply(node, root, snapshot, rx));

        Ok(Self {
            token,
            watcher: Some(watcher),
            poller: Some(poller),
            applier: Some(applier),
        })
    }

    /// Stops both producers and waits for the applier to drain the queue.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(watcher) = self.watcher.take() {
            watcher.join().await;
        }
        for handle in [self.poller.take(), self.applier.take()].into_iter().flatten() {
            if let Err(e) = handle.await {
                warn!(error = %e, "daemon task ended abnormally");
            }
        }
        info!("daemon stopped");
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Fetches what is missing or older locally and stores what is missing or
/// older on the server. Returns the snapshot the applier starts from.
async fn reconcile(node: &ClientNode, filter: &NameFilter) -> ClientResult<ClientSnapshot> {
    let listing = node.list().await?;
    let mut snapshot = ClientSnapshot::from_listing(&listing);
    let root = node.mount_path();
    let mut unfetched = HashSet::new();

    for file in &listing.files {
        let stale = match stat(root, &file.name).await? {
            Some(local) => local.modified < file.modified,
            None => true,
        };
        if stale {
            match node.fetch(&file.name).await {
                Ok(FetchOutcome::Fetched { bytes, modified }) => {
                    snapshot.record(&file.name, FileStamp { modified, size: bytes })
                }
                Ok(FetchOutcome::AlreadySynchronized) => {}
                Err(e) => {
                    log_error("fetch", &file.name, &e);
                    // Retried by the first poll; the stale local copy stays put.
                    snapshot.forget(&file.name);
                    unfetched.insert(file.name.clone());
                }
            }
        }
    }

    for local in scan(root).await? {
        if !filter.accepts(&local.name) || unfetched.contains(&local.name) {
            continue;
        }
        let stale = match snapshot.get(&local.name) {
            Some(known) => known.modified < local.modified,
            None => true,
        };
        if stale {
            match store_with_retry(node, &local.name).await {
                Ok(StoreOutcome::Stored(ack)) => snapshot.record(
                    &ack.name,
                    FileStamp {
                        modified: ack.modified,
                        size: local.size,
                    },
                ),
                Ok(StoreOutcome::AlreadySynchronized) => {}
                Err(e) => log_error("store", &local.name, &e),
            }
        }
    }
    Ok(snapshot)
}

async fn poll(
    node: Arc<ClientNode>,
    interval: Duration,
    tx: mpsc::Sender<SyncEvent>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        match node.callback_list().await {
            Ok(listing) => {
                if tx.send(SyncEvent::Listing(listing)).await.is_err() {
                    break;
                }
            }
            Err(e) => log_error("callback_list", "", &e),
        }
    }
    debug!("poller stopped");
}

async fn apply(
    node: Arc<ClientNode>,
    root: PathBuf,
    mut snapshot: ClientSnapshot,
    mut rx: mpsc::Receiver<SyncEvent>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            SyncEvent::Store(name) => apply_store(&node, &root, &mut snapshot, &name).await,
            SyncEvent::Delete(name) => apply_delete(&node, &root, &mut snapshot, &name).await,
            SyncEvent::Listing(listing) => apply_listing(&node, &root, &mut snapshot, &listing).await,
        }
    }
    debug!("applier drained");
}

async fn apply_store(node: &ClientNode, root: &Path, snapshot: &mut ClientSnapshot, name: &str) {
    let local = match stat(root, name).await {
        Ok(Some(local)) => local,
        Ok(None) => {
            debug!(file = name, "gone before upload, skipping");
            return;
        }
        Err(e) => {
            log_error("store", name, &ClientError::from(e));
            return;
        }
    };
    if is_echo(snapshot, name, &local) {
        debug!(file = name, "local copy matches last sync, skipping upload");
        return;
    }
    match store_with_retry(node, name).await {
        Ok(StoreOutcome::Stored(ack)) => snapshot.record(
            &ack.name,
            FileStamp {
                modified: ack.modified,
                size: local.size,
            },
        ),
        Ok(StoreOutcome::AlreadySynchronized) => {}
        Err(e) => log_error("store", name, &e),
    }
}

async fn apply_delete(node: &ClientNode, root: &Path, snapshot: &mut ClientSnapshot, name: &str) {
    let exists = matches!(stat(root, name).await, Ok(Some(_)));
    if !should_delete_remote(snapshot, name, exists) {
        debug!(file = name, exists, "not deleting on server");
        return;
    }
    match node.delete(name).await {
        Ok(_) => {}
        Err(e) if e.is_not_found() => debug!(file = name, "already gone on server"),
        Err(e) => log_error("delete", name, &e),
    }
    snapshot.forget(name);
}

async fn apply_listing(node: &ClientNode, root: &Path, snapshot: &mut ClientSnapshot, listing: &FileList) {
    let diff = snapshot.diff(listing);
    let previous = snapshot.clone();
    snapshot.replace(listing);
    for name in &diff.changed {
        match node.fetch(name).await {
            Ok(FetchOutcome::Fetched { bytes, modified }) => {
                debug!(file = %name, bytes, "applied remote change");
                snapshot.record(name, FileStamp { modified, size: bytes });
            }
            Ok(FetchOutcome::AlreadySynchronized) => {}
            Err(e) => {
                log_error("fetch", name, &e);
                snapshot.restore(name, &previous);
            }
        }
    }
    for name in &diff.removed {
        remove_local(root, name).await;
    }
}

/// True when the local file still carries the stamp of the applier's last
/// fetch or store of it. Such watcher events come from the applier itself.
fn is_echo(snapshot: &ClientSnapshot, name: &str, local: &FileRecord) -> bool {
    snapshot.get(name) == Some(FileStamp::of_local(local))
}

/// A local delete reaches the server only for a file the server is known to
/// have and that did not reappear locally.
fn should_delete_remote(snapshot: &ClientSnapshot, name: &str, exists_locally: bool) -> bool {
    !exists_locally && snapshot.contains(name)
}

async fn store_with_retry(node: &ClientNode, name: &str) -> ClientResult<StoreOutcome> {
    let mut attempt = 1;
    loop {
        match node.store(name).await {
            Err(e) if e.code() == StatusCode::ResourceExhausted && attempt < STORE_ATTEMPTS => {
                debug!(file = name, attempt, "write lock busy, retrying");
                attempt += 1;
                tokio::time::sleep(STORE_RETRY_DELAY).await;
            }
            other => return other,
        }
    }
}

async fn remove_local(root: &Path, name: &str) {
    let Ok(Some(local)) = stat(root, name).await else {
        return;
    };
    match tokio::fs::remove_file(&local.path).await {
        Ok(()) => info!(file = name, "removed local copy"),
        Err(e) => warn!(file = name, error = %e, "failed to remove local copy"),
    }
}

fn log_error(op: &'static str, name: &str, e: &ClientError) {
    warn!(op, file = name, code = %e.code(), error = %e, "sync operation failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfsync_transport::FileStatus;

    fn listing(entries: &[(&str, i64)]) -> FileList {
        let sized: Vec<(&str, i64, u64)> = entries.iter().map(|(n, m)| (*n, *m, 1)).collect();
        sized_listing(&sized)
    }

    fn sized_listing(entries: &[(&str, i64, u64)]) -> FileList {
        FileList {
            files: entries
                .iter()
                .map(|(name, modified, size)| FileStatus {
                    name: name.to_string(),
                    size: *size,
                    created: 0,
                    modified: *modified,
                })
                .collect(),
        }
    }

    fn local(name: &str, modified: i64, size: u64) -> FileRecord {
        FileRecord {
            name: name.to_string(),
            path: PathBuf::from(name),
            size,
            created: 0,
            modified,
        }
    }

    #[test]
    fn test_diff_reports_new_updated_and_removed() {
        let snapshot = ClientSnapshot::from_listing(&listing(&[("a.txt", 1), ("b.txt", 1), ("c.txt", 1)]));
        let diff = snapshot.diff(&listing(&[("a.txt", 1), ("b.txt", 2), ("d.txt", 5)]));
        assert_eq!(diff.changed, vec!["b.txt".to_string(), "d.txt".to_string()]);
        assert_eq!(diff.removed, vec!["c.txt".to_string()]);
    }

    #[test]
    fn test_diff_of_identical_listing_is_empty() {
        let current = listing(&[("a.txt", 7)]);
        let snapshot = ClientSnapshot::from_listing(&current);
        assert_eq!(snapshot.diff(&current), SnapshotDiff::default());
    }

    #[test]
    fn test_record_suppresses_refetch_of_own_store() {
        let mut snapshot = ClientSnapshot::default();
        snapshot.record("mine.txt", FileStamp { modified: 42, size: 1 });
        assert!(snapshot.diff(&listing(&[("mine.txt", 42)])).changed.is_empty());
        snapshot.forget("mine.txt");
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_diff_catches_same_second_rewrite_by_size() {
        let snapshot = ClientSnapshot::from_listing(&sized_listing(&[("a.txt", 10, 11)]));
        let diff = snapshot.diff(&sized_listing(&[("a.txt", 10, 12)]));
        assert_eq!(diff.changed, vec!["a.txt".to_string()]);
    }

    #[test]
    fn test_restore_keeps_failed_fetch_pending() {
        let mut snapshot = ClientSnapshot::from_listing(&listing(&[("x.txt", 1)]));
        let newer = listing(&[("x.txt", 2), ("y.txt", 2)]);
        let previous = snapshot.clone();
        snapshot.replace(&newer);
        // Both fetches failed.
        snapshot.restore("x.txt", &previous);
        snapshot.restore("y.txt", &previous);

        assert_eq!(snapshot.get("x.txt"), Some(FileStamp { modified: 1, size: 1 }));
        assert!(!snapshot.contains("y.txt"));
        let retry = snapshot.diff(&newer);
        assert_eq!(retry.changed, vec!["x.txt".to_string(), "y.txt".to_string()]);
        assert!(retry.removed.is_empty());
    }

    #[test]
    fn test_unchanged_local_copy_is_an_echo() {
        let mut snapshot = ClientSnapshot::default();
        snapshot.record("n.txt", FileStamp { modified: 100, size: 5 });
        assert!(is_echo(&snapshot, "n.txt", &local("n.txt", 100, 5)));
        assert!(!is_echo(&snapshot, "n.txt", &local("n.txt", 101, 5)));
        assert!(!is_echo(&snapshot, "n.txt", &local("n.txt", 100, 6)));
        assert!(!is_echo(&snapshot, "other.txt", &local("other.txt", 100, 5)));
    }

    #[test]
    fn test_delete_needs_known_file_still_absent() {
        let snapshot = ClientSnapshot::from_listing(&listing(&[("kept.txt", 1)]));
        assert!(should_delete_remote(&snapshot, "kept.txt", false));
        // Recreated locally before the event was applied.
        assert!(!should_delete_remote(&snapshot, "kept.txt", true));
        // Already removed by the applier after a remote delete.
        assert!(!should_delete_remote(&snapshot, "gone.txt", false));
    }

    #[test]
    fn test_local_change_maps_to_sync_event() {
        assert_eq!(SyncEvent::from(LocalChange::Store("a".into())), SyncEvent::Store("a".into()));
        assert_eq!(SyncEvent::from(LocalChange::Delete("a".into())), SyncEvent::Delete("a".into()));
    }

    #[tokio::test]
    async fn test_remove_local_ignores_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.txt"), b"x").unwrap();
        remove_local(dir.path(), "x.txt").await;
        remove_local(dir.path(), "x.txt").await;
        assert!(!dir.path().join("x.txt").exists());
    }
}
