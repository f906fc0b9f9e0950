//! Typed client for the dfsync RPC surface.
//!
//! `store` and `delete` take the server write lock first. Content-identical
//! replies come back as [`StoreOutcome::AlreadySynchronized`] or
//! [`FetchOutcome::AlreadySynchronized`], never as errors.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dfsync_storage::{stat, touch_mtime, validate_name, AtomicFile, FileRecord};
use dfsync_transport::{
    decode_reply, CallEvent, CallMetadata, ClientCall, Empty, FileAck, FileList, FileRequest,
    FileStatus, Opcode, RpcClient, StatusCode,
};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// Result of a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The server accepted new content.
    Stored(FileAck),
    /// The server already had identical content.
    AlreadySynchronized,
}

/// Result of a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// New content was written locally.
    Fetched {
        /// Bytes received.
        bytes: u64,
        /// Server mtime stamped onto the local copy.
        modified: i64,
    },
    /// The local copy already matched the server.
    AlreadySynchronized,
}

/// One client's connection to the server plus its mount directory.
pub struct ClientNode {
    addr: String,
    client_id: String,
    root: PathBuf,
    deadline_ms: u64,
    chunk_size: usize,
    rpc: Mutex<Option<Arc<RpcClient>>>,
}

impl ClientNode {
    /// Connects using `config`.
    pub async fn connect(config: &ClientConfig) -> ClientResult<Self> {
        let node = Self {
            addr: config.server_addr.clone(),
            client_id: config.client_id.clone(),
            root: config.mount_path.clone(),
            deadline_ms: config.deadline_timeout_ms,
            chunk_size: config.chunk_size.max(1),
            rpc: Mutex::new(None),
        };
        node.channel().await?;
        info!(addr = %node.addr, client_id = %node.client_id, "connected to server");
        Ok(node)
    }

    /// This client's identifier.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Local mount directory.
    pub fn mount_path(&self) -> &Path {
        &self.root
    }

    /// The live connection, reconnecting if the previous one dropped.
    async fn channel(&self) -> ClientResult<Arc<RpcClient>> {
        let mut slot = self.rpc.lock().await;
        if let Some(rpc) = slot.as_ref() {
            if rpc.is_connected() {
                return Ok(rpc.clone());
            }
            debug!(addr = %self.addr, "connection lost, reconnecting");
        }
        let rpc = Arc::new(RpcClient::connect(&self.addr).await?);
        *slot = Some(rpc.clone());
        Ok(rpc)
    }

    fn metadata(&self) -> CallMetadata {
        CallMetadata::for_client(self.client_id.clone()).with_timeout_ms(self.deadline_ms)
    }

    /// Takes the server write lock on `name`.
    pub async fn request_write_access(&self, name: &str) -> ClientResult<()> {
        let rpc = self.channel().await?;
        let _: Empty = rpc
            .unary(
                Opcode::AcquireWriteLock,
                self.metadata(),
                &FileRequest { name: name.to_string() },
            )
            .await?;
        debug!(file = name, "write access granted");
        Ok(())
    }

    /// Uploads the local copy of `name`.
    ///
    /// After a successful upload the server's modified time is stamped onto
    /// the local file.
    pub async fn store(&self, name: &str) -> ClientResult<StoreOutcome> {
        let record = self.local(name).await?.ok_or_else(|| ClientError::LocalMissing {
            name: name.to_string(),
        })?;
        let checksum = record
            .checksum()
            .await?
            .ok_or_else(|| ClientError::LocalMissing { name: name.to_string() })?;

        self.request_write_access(name).await?;

        let metadata = self
            .metadata()
            .with_filename(name)
            .with_checksum(Some(checksum.value()))
            .with_mtime(Some(record.modified));
        let rpc = self.channel().await?;
        let mut call = rpc.start_call(Opcode::WriteFile, metadata, &Empty, false).await?;

        let early = self.upload(&mut call, &record.path).await?;
        let payload = match early {
            Some(payload) => payload,
            None => {
                call.finish_send().await?;
                reply_payload(&mut call).await?
            }
        };

        match decode_reply::<FileAck>(&payload) {
            Ok(ack) => {
                touch_mtime(&record.path, ack.modified).await?;
                info!(file = name, bytes = record.size, "stored");
                Ok(StoreOutcome::Stored(ack))
            }
            Err(e) => match ClientError::from(e) {
                ClientError::Remote(status) if status.code == StatusCode::AlreadyExists => {
                    debug!(file = name, "store skipped, server already synchronized");
                    Ok(StoreOutcome::AlreadySynchronized)
                }
                other => Err(other),
            },
        }
    }

    /// Streams the file; returns the reply early if the server answered
    /// before the upload finished.
    async fn upload(&self, call: &mut ClientCall, path: &Path) -> ClientResult<Option<Vec<u8>>> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            if let Some(event) = call.try_recv() {
                if let CallEvent::Reply(payload) = event? {
                    return Ok(Some(payload));
                }
            }
            let n = file.read(&mut buf).await?;
            if n == 0 {
                return Ok(None);
            }
            call.send_data(&buf[..n]).await?;
        }
    }

    /// Downloads `name` unless the local copy already matches.
    ///
    /// Content lands through a hidden temp file and an atomic rename, then
    /// receives the server's modified time.
    pub async fn fetch(&self, name: &str) -> ClientResult<FetchOutcome> {
        validate_name(name)?;
        let (checksum, mtime) = match self.local(name).await? {
            Some(record) => (record.checksum().await?.map(|c| c.value()), Some(record.modified)),
            None => (None, None),
        };
        let metadata = self.metadata().with_checksum(checksum).with_mtime(mtime);
        let rpc = self.channel().await?;
        let mut call = rpc
            .start_call(
                Opcode::GetFile,
                metadata,
                &FileRequest { name: name.to_string() },
                true,
            )
            .await?;

        let mut out = AtomicFile::create(&self.root, name).await?;
        loop {
            match call.recv().await? {
                CallEvent::Data(chunk) => out.write_chunk(&chunk).await?,
                CallEvent::Reply(payload) => match decode_reply::<FileAck>(&payload) {
                    Ok(ack) => {
                        let bytes = out.commit(Some(ack.modified)).await?;
                        info!(file = name, bytes, "fetched");
                        return Ok(FetchOutcome::Fetched {
                            bytes,
                            modified: ack.modified,
                        });
                    }
                    Err(e) => {
                        return match ClientError::from(e) {
                            ClientError::Remote(status) if status.code == StatusCode::AlreadyExists => {
                                debug!(file = name, "fetch skipped, already synchronized");
                                Ok(FetchOutcome::AlreadySynchronized)
                            }
                            other => Err(other),
                        }
                    }
                },
            }
        }
    }

    /// Deletes `name` on the server; returns its last modified time.
    pub async fn delete(&self, name: &str) -> ClientResult<FileAck> {
        self.request_write_access(name).await?;
        let rpc = self.channel().await?;
        let ack: FileAck = rpc
            .unary(
                Opcode::DeleteFile,
                self.metadata(),
                &FileRequest { name: name.to_string() },
            )
            .await?;
        info!(file = name, "deleted on server");
        Ok(ack)
    }

    /// Every file on the server.
    pub async fn list(&self) -> ClientResult<FileList> {
        let rpc = self.channel().await?;
        Ok(rpc.unary(Opcode::ListFiles, self.metadata(), &Empty).await?)
    }

    /// One file's server-side status.
    pub async fn stat(&self, name: &str) -> ClientResult<FileStatus> {
        let rpc = self.channel().await?;
        Ok(rpc
            .unary(
                Opcode::GetFileStatus,
                self.metadata(),
                &FileRequest { name: name.to_string() },
            )
            .await?)
    }

    /// Asks the notification pipeline for the current listing.
    pub async fn callback_list(&self) -> ClientResult<FileList> {
        let rpc = self.channel().await?;
        Ok(rpc
            .unary(
                Opcode::CallbackList,
                self.metadata(),
                &FileRequest { name: String::new() },
            )
            .await?)
    }

    async fn local(&self, name: &str) -> ClientResult<Option<FileRecord>> {
        Ok(stat(&self.root, name).await?)
    }
}

async fn reply_payload(call: &mut ClientCall) -> ClientResult<Vec<u8>> {
    loop {
        if let CallEvent::Reply(payload) = call.recv().await? {
            return Ok(payload);
        }
    }
}
