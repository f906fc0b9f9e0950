//! File operation handlers.
//!
//! Guard discipline per operation:
//!
//! | op     | directory guard | file guard |
//! |--------|-----------------|------------|
//! | store  | exclusive       | exclusive  |
//! | delete | exclusive       | exclusive  |
//! | fetch  | -               | shared     |
//! | stat   | -               | shared     |
//! | list   | shared          | -          |
//!
//! Guards and write leases are RAII values, so every early return releases
//! them.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dfsync_storage::{file_checksum, resolve, scan, stat, touch_mtime, validate_name, AtomicFile, Checksum, FileRecord};
use dfsync_transport::{CallContext, FileAck, FileList, FileStatus, Inbound, ResponseSink, RpcStatus};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::error::{ServiceError, ServiceResult};
use crate::guard::GuardSet;
use crate::lock::{AcquireOutcome, LockManager};

/// Source of client-streamed chunks.
#[async_trait]
pub trait ChunkSource: Send {
    /// Next chunk, `None` at end of stream.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RpcStatus>;
}

/// Destination for server-streamed chunks.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    /// Sends one chunk.
    async fn send_chunk(&self, chunk: &[u8]) -> Result<(), RpcStatus>;
}

#[async_trait]
impl ChunkSource for Inbound {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RpcStatus> {
        Inbound::next_chunk(self).await
    }
}

#[async_trait]
impl ChunkSink for ResponseSink {
    async fn send_chunk(&self, chunk: &[u8]) -> Result<(), RpcStatus> {
        self.send_data(chunk).await
    }
}

/// Metadata a Store call must carry.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    /// Target filename.
    pub name: String,
    /// Caller identity, checked against the lock table.
    pub client_id: String,
    /// CRC-32 of the caller's content.
    pub checksum: u32,
    /// Caller's modification time.
    pub mtime: i64,
}

/// Metadata a Fetch call may carry.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    /// Target filename.
    pub name: String,
    /// CRC-32 of the caller's copy, if it has one.
    pub checksum: Option<u32>,
    /// Caller's modification time, if it has a copy.
    pub mtime: Option<i64>,
}

/// Store, fetch, delete, list and stat over one mount directory.
#[derive(Debug)]
pub struct FileService {
    root: PathBuf,
    locks: LockManager,
    guards: GuardSet,
    chunk_size: usize,
}

impl FileService {
    /// Creates a service rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, chunk_size: usize) -> Self {
        Self {
            root: root.into(),
            locks: LockManager::new(),
            guards: GuardSet::new(),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Mount directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lock table.
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Guard set.
    pub fn guards(&self) -> &GuardSet {
        &self.guards
    }

    /// Creates a guard for every regular file already present.
    pub async fn load_existing(&self) -> ServiceResult<usize> {
        let records = scan(&self.root).await?;
        for record in &records {
            self.guards.guard(&record.name);
        }
        info!(root = %self.root.display(), files = records.len(), "loaded existing files");
        Ok(records.len())
    }

    /// Grants `client_id` the write lock on `name`.
    pub fn acquire_write_lock(&self, name: &str, client_id: &str) -> ServiceResult<AcquireOutcome> {
        validate_name(name)?;
        match self.locks.acquire(name, client_id) {
            AcquireOutcome::Denied(holder) => {
                info!(file = name, client_id, holder = %holder, "write lock denied");
                Err(ServiceError::LockConflict {
                    name: name.to_string(),
                    holder,
                })
            }
            outcome => Ok(outcome),
        }
    }

    /// Accepts streamed content for a file whose lock the caller holds.
    ///
    /// Identical content is not rewritten; only a newer client mtime is
    /// adopted. The lock is released however the call ends.
    pub async fn store<S: ChunkSource>(
        &self,
        req: StoreRequest,
        source: &mut S,
        ctx: &CallContext,
    ) -> ServiceResult<FileAck> {
        validate_name(&req.name)?;
        let _lease = self.locks.verify(&req.name, &req.client_id)?;
        ctx.check()?;

        let _dir = self.guards.directory_exclusive().await;
        let _file = self.guards.file_exclusive(&req.name).await;
        ctx.check()?;

        let path = resolve(&self.root, &req.name)?;
        let client_checksum = Checksum::new(req.checksum);
        if file_checksum(&path).await? == Some(client_checksum) {
            self.adopt_newer_mtime(&req.name, &path, Some(req.mtime)).await?;
            info!(file = %req.name, client_id = %req.client_id, "store skipped, content identical");
            return Err(ServiceError::AlreadySynchronized { name: req.name });
        }

        let mut out = AtomicFile::create(&self.root, &req.name).await?;
        loop {
            ctx.check()?;
            match source.next_chunk().await? {
                Some(chunk) => {
                    out.write_chunk(&chunk).await?;
                    debug!(file = %req.name, bytes = chunk.len(), "chunk written");
                }
                None => break,
            }
        }
        ctx.check()?;
        let bytes = out.commit(None).await?;

        let record = stat(&self.root, &req.name)
            .await?
            .ok_or_else(|| ServiceError::NotFound { name: req.name.clone() })?;
        info!(file = %req.name, client_id = %req.client_id, bytes, "stored file");
        Ok(FileAck {
            name: record.name,
            modified: record.modified,
        })
    }

    /// Streams a file's content unless the caller already has it.
    pub async fn fetch<K: ChunkSink>(
        &self,
        req: FetchRequest,
        sink: &K,
        ctx: &CallContext,
    ) -> ServiceResult<FileAck> {
        validate_name(&req.name)?;
        ctx.check()?;
        let _file = self.guards.file_shared(&req.name).await;

        let record = self.require(&req.name).await?;
        if let Some(client) = req.checksum {
            if record.checksum().await? == Some(Checksum::new(client)) {
                self.adopt_newer_mtime(&req.name, &record.path, req.mtime).await?;
                debug!(file = %req.name, "fetch skipped, content identical");
                return Err(ServiceError::AlreadySynchronized { name: req.name });
            }
        }

        let mut file = match tokio::fs::File::open(&record.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ServiceError::NotFound { name: req.name })
            }
            Err(e) => return Err(e.into()),
        };
        let mut buf = vec![0u8; self.chunk_size];
        let mut sent = 0u64;
        loop {
            ctx.check()?;
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            sink.send_chunk(&buf[..n]).await?;
            sent += n as u64;
        }
        info!(file = %req.name, bytes = sent, "served file");
        Ok(FileAck {
            name: record.name,
            modified: record.modified,
        })
    }

    /// Removes a file whose lock the caller holds; returns its last mtime.
    pub async fn delete(&self, name: &str, client_id: &str, ctx: &CallContext) -> ServiceResult<FileAck> {
        validate_name(name)?;
        let _lease = self.locks.verify(name, client_id)?;
        ctx.check()?;

        let _dir = self.guards.directory_exclusive().await;
        let _file = self.guards.file_exclusive(name).await;
        ctx.check()?;

        let record = self.require(name).await?;
        tokio::fs::remove_file(&record.path).await.map_err(|e| {
            warn!(file = name, error = %e, "remove failed");
            ServiceError::Io(e)
        })?;
        info!(file = name, client_id, "deleted file");
        Ok(FileAck {
            name: record.name,
            modified: record.modified,
        })
    }

    /// Every regular file in the mount directory.
    pub async fn list(&self) -> ServiceResult<FileList> {
        let _dir = self.guards.directory_shared().await;
        let files = scan(&self.root).await?.into_iter().map(to_status).collect();
        Ok(FileList { files })
    }

    /// Size and timestamps of one file.
    pub async fn stat(&self, name: &str, ctx: &CallContext) -> ServiceResult<FileStatus> {
        validate_name(name)?;
        ctx.check()?;
        let _file = self.guards.file_shared(name).await;
        Ok(to_status(self.require(name).await?))
    }

    async fn require(&self, name: &str) -> ServiceResult<FileRecord> {
        stat(&self.root, name)
            .await?
            .ok_or_else(|| ServiceError::NotFound { name: name.to_string() })
    }

    async fn adopt_newer_mtime(&self, name: &str, path: &Path, client_mtime: Option<i64>) -> ServiceResult<()> {
        let Some(client_mtime) = client_mtime else {
            return Ok(());
        };
        if let Some(record) = stat(&self.root, name).await? {
            if client_mtime > record.modified {
                touch_mtime(path, client_mtime).await?;
                debug!(file = name, mtime = client_mtime, "adopted newer client mtime");
            }
        }
        Ok(())
    }
}

fn to_status(record: FileRecord) -> FileStatus {
    FileStatus {
        name: record.name,
        size: record.size,
        created: record.created,
        modified: record.modified,
    }
}
