#![warn(missing_docs)]

//! dfsync client subsystem: typed RPC node, local watcher and sync daemon
//!
//! [`ClientNode`] wraps every server operation. [`Daemon`] mounts a local
//! directory, reconciles it once with the server, then keeps it in sync from
//! two producers (the [`LocalWatcher`] and a CallbackList poller) feeding a
//! single applier.

#[allow(missing_docs)]
pub mod config;
pub mod daemon;
#[allow(missing_docs)]
pub mod error;
pub mod node;
pub mod watch;

pub use config::{default_client_id, ClientConfig, DEFAULT_EXTENSIONS};
pub use daemon::{ClientSnapshot, Daemon, FileStamp, SnapshotDiff, SyncEvent};
pub use error::{ClientError, ClientResult};
pub use node::{ClientNode, FetchOutcome, StoreOutcome};
pub use watch::{classify, ChangeKind, LocalChange, LocalWatcher, NameFilter, WATCH_DEBOUNCE_MS};
