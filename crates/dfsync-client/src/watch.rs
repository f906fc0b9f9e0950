//! Local mount directory watching.
//!
//! Raw `notify` events are bridged into tokio, filtered by name, mapped to
//! [`LocalChange`]s and debounced per file before they reach the daemon.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dfsync_storage::is_part_file;
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ClientResult;

/// Quiet period before a burst of events on one file is reported.
pub const WATCH_DEBOUNCE_MS: u64 = 100;

/// What the daemon should do about a local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalChange {
    /// Upload the local copy.
    Store(String),
    /// Remove the file on the server.
    Delete(String),
}

impl LocalChange {
    /// The file this change is about.
    pub fn name(&self) -> &str {
        match self {
            LocalChange::Store(name) | LocalChange::Delete(name) => name,
        }
    }
}

/// Decides which file names take part in synchronization.
#[derive(Debug, Clone, Default)]
pub struct NameFilter {
    extensions: Vec<String>,
}

impl NameFilter {
    /// An empty whitelist accepts every extension.
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    /// True if `name` should be synchronized.
    pub fn accepts(&self, name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || is_part_file(name) {
            return false;
        }
        if self.extensions.is_empty() {
            return true;
        }
        match Path::new(name).extension().and_then(|e| e.to_str()) {
            Some(ext) => {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|allowed| *allowed == ext)
            }
            None => false,
        }
    }
}

/// Maps one raw event on `path` to a change.
///
/// Metadata-only modifications are ignored: they are what a fetch or a
/// store acknowledgment produces when it stamps the modified time.
pub fn classify(kind: &EventKind, path: &Path) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Store),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::To => Some(ChangeKind::Store),
            RenameMode::From => Some(ChangeKind::Delete),
            RenameMode::Both | RenameMode::Any | RenameMode::Other => {
                if path.exists() {
                    Some(ChangeKind::Store)
                } else {
                    Some(ChangeKind::Delete)
                }
            }
        },
        EventKind::Modify(_) => Some(ChangeKind::Store),
        EventKind::Remove(_) => Some(ChangeKind::Delete),
        _ => None,
    }
}

/// Direction of a change before it is tied to a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Content appeared or changed.
    Store,
    /// File disappeared.
    Delete,
}

/// Watches `root` non-recursively until `token` is cancelled.
pub struct LocalWatcher {
    handle: JoinHandle<()>,
}

impl LocalWatcher {
    /// Installs the watcher and spawns the debounce loop.
    pub fn spawn<T>(
        root: PathBuf,
        filter: NameFilter,
        tx: mpsc::Sender<T>,
        token: CancellationToken,
    ) -> ClientResult<Self>
    where
        T: From<LocalChange> + Send + 'static,
    {
        let (notify_tx, notify_rx) = mpsc::channel::<notify::Result<Event>>(256);
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = notify_tx.blocking_send(res);
            },
            Config::default(),
        )?;
        watcher.watch(&root, RecursiveMode::NonRecursive)?;
        info!(path = %root.display(), "watching mount directory");

        let handle = tokio::spawn(run(watcher, notify_rx, filter, tx, token));
        Ok(Self { handle })
    }

    /// Waits for the loop to exit.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            warn!(error = %e, "watcher task ended abnormally");
        }
    }
}

async fn run<T: From<LocalChange>>(
    // Dropping the watcher stops event delivery.
    _watcher: RecommendedWatcher,
    mut notify_rx: mpsc::Receiver<notify::Result<Event>>,
    filter: NameFilter,
    tx: mpsc::Sender<T>,
    token: CancellationToken,
) {
    let debounce = Duration::from_millis(WATCH_DEBOUNCE_MS);
    let mut pending: HashMap<String, (ChangeKind, Instant)> = HashMap::new();

    loop {
        let next_due = pending.values().map(|(_, due)| *due).min();
        tokio::select! {
            _ = token.cancelled() => break,
            res = notify_rx.recv() => {
                let event = match res {
                    Some(Ok(event)) => event,
                    Some(Err(e)) => {
                        warn!(error = %e, "file watcher error");
                        continue;
                    }
                    None => break,
                };
                for path in &event.paths {
                    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    if !filter.accepts(name) {
                        continue;
                    }
                    if let Some(kind) = classify(&event.kind, path) {
                        debug!(file = name, ?kind, "local change observed");
                        pending.insert(name.to_string(), (kind, Instant::now() + debounce));
                    }
                }
            }
            _ = async {
                match next_due {
                    Some(due) => tokio::time::sleep_until(due).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                let now = Instant::now();
                let due: Vec<String> = pending
                    .iter()
                    .filter(|(_, (_, at))| *at <= now)
                    .map(|(name, _)| name.clone())
                    .collect();
                for name in due {
                    if let Some((kind, _)) = pending.remove(&name) {
                        let change = match kind {
                            ChangeKind::Store => LocalChange::Store(name),
                            ChangeKind::Delete => LocalChange::Delete(name),
                        };
                        if tx.send(change.into()).await.is_err() {
                            debug!("change receiver closed, watcher exiting");
                            return;
                        }
                    }
                }
            }
        }
    }
    debug!("watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};

    #[test]
    fn test_filter_whitelist_is_case_insensitive() {
        let filter = NameFilter::new(["txt", ".PNG"]);
        assert!(filter.accepts("notes.txt"));
        assert!(filter.accepts("NOTES.TXT"));
        assert!(filter.accepts("photo.png"));
        assert!(!filter.accepts("binary.exe"));
        assert!(!filter.accepts("README"));
    }

    #[test]
    fn test_filter_rejects_hidden_and_part_files() {
        let filter = NameFilter::new(Vec::<String>::new());
        assert!(filter.accepts("anything.bin"));
        assert!(filter.accepts("README"));
        assert!(!filter.accepts(".hidden.txt"));
        assert!(!filter.accepts(".notes.txt.dfsync-part"));
        assert!(!filter.accepts(""));
    }

    #[test]
    fn test_classify_events() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("here.txt");
        std::fs::write(&present, b"x").unwrap();
        let gone = dir.path().join("gone.txt");

        assert_eq!(classify(&EventKind::Create(CreateKind::File), &present), Some(ChangeKind::Store));
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Data(DataChange::Content)), &present),
            Some(ChangeKind::Store)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::WriteTime)), &present),
            None
        );
        assert_eq!(classify(&EventKind::Remove(RemoveKind::File), &gone), Some(ChangeKind::Delete));
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::To)), &present),
            Some(ChangeKind::Store)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::From)), &gone),
            Some(ChangeKind::Delete)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::Any)), &present),
            Some(ChangeKind::Store)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::Any)), &gone),
            Some(ChangeKind::Delete)
        );
    }

    #[tokio::test]
    async fn test_watcher_reports_new_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel::<LocalChange>(16);
        let token = CancellationToken::new();
        let watcher = LocalWatcher::spawn(
            dir.path().to_path_buf(),
            NameFilter::new(["txt"]),
            tx,
            token.clone(),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(dir.path().join("ignored.bin"), b"skip").unwrap();
        std::fs::write(dir.path().join("seen.txt"), b"one").unwrap();
        std::fs::write(dir.path().join("seen.txt"), b"two").unwrap();

        let change = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change, LocalChange::Store("seen.txt".into()));

        token.cancel();
        watcher.join().await;
    }
}
