//! Maps incoming calls onto [`FileService`] and the notification pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use dfsync_transport::{
    deserialize_message, encode_body, CallHandler, CallMetadata, Empty, FileRequest, Opcode,
    RpcReply, RpcStatus, ServerCall,
};
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::error::{ServiceError, ServiceResult};
use crate::pipeline::NotificationPipeline;
use crate::service::{FetchRequest, FileService, StoreRequest};

/// The server side of every dfsync RPC.
pub struct FileServiceHandler {
    service: Arc<FileService>,
    pipeline: Arc<NotificationPipeline>,
}

impl FileServiceHandler {
    /// Creates a handler over a shared service and pipeline.
    pub fn new(service: Arc<FileService>, pipeline: Arc<NotificationPipeline>) -> Self {
        Self { service, pipeline }
    }

    async fn dispatch(&self, mut call: ServerCall) -> ServiceResult<Vec<u8>> {
        let body = match call.opcode {
            Opcode::AcquireWriteLock => {
                let req: FileRequest = decode(&call.body)?;
                let client_id = require_client(&call.metadata)?;
                let outcome = self.service.acquire_write_lock(&req.name, client_id)?;
                info!(file = %req.name, client_id, ?outcome, "write lock acquired");
                encode_body(&Empty)
            }
            Opcode::WriteFile => {
                let req = StoreRequest {
                    name: call
                        .metadata
                        .filename
                        .clone()
                        .ok_or(ServiceError::InvalidMetadata { field: "filename" })?,
                    client_id: require_client(&call.metadata)?.to_string(),
                    checksum: call
                        .metadata
                        .checksum
                        .ok_or(ServiceError::InvalidMetadata { field: "checksum" })?,
                    mtime: call
                        .metadata
                        .mtime
                        .ok_or(ServiceError::InvalidMetadata { field: "mtime" })?,
                };
                let ack = self.service.store(req, &mut call.inbound, &call.ctx).await?;
                encode_body(&ack)
            }
            Opcode::GetFile => {
                let req: FileRequest = decode(&call.body)?;
                let fetch = FetchRequest {
                    name: req.name,
                    checksum: call.metadata.checksum,
                    mtime: call.metadata.mtime,
                };
                let ack = self.service.fetch(fetch, &call.sink, &call.ctx).await?;
                encode_body(&ack)
            }
            Opcode::DeleteFile => {
                let req: FileRequest = decode(&call.body)?;
                let client_id = require_client(&call.metadata)?;
                let ack = self.service.delete(&req.name, client_id, &call.ctx).await?;
                encode_body(&ack)
            }
            Opcode::ListFiles => encode_body(&self.service.list().await?),
            Opcode::GetFileStatus => {
                let req: FileRequest = decode(&call.body)?;
                encode_body(&self.service.stat(&req.name, &call.ctx).await?)
            }
            Opcode::CallbackList => {
                // The filename in the request is a placeholder and is ignored.
                let listing = self.pipeline.submit(call.ctx.clone()).await?;
                encode_body(&listing)
            }
            Opcode::Cancel => Err(RpcStatus::internal("cancel is not a call")),
        };
        body.map_err(ServiceError::Stream)
    }
}

#[async_trait]
impl CallHandler for FileServiceHandler {
    async fn handle(&self, call: ServerCall) -> RpcReply<Vec<u8>> {
        let opcode = call.opcode;
        let client_id = call.metadata.client_id.clone().unwrap_or_default();
        self.dispatch(call).await.map_err(|e| {
            let status = e.status();
            if !matches!(e, ServiceError::AlreadySynchronized { .. } | ServiceError::NotFound { .. }) {
                warn!(?opcode, client_id = %client_id, code = %status.code, error = %e, "call failed");
            }
            status
        })
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> ServiceResult<T> {
    deserialize_message(body).map_err(|e| ServiceError::Stream(RpcStatus::internal(e.to_string())))
}

fn require_client(metadata: &CallMetadata) -> ServiceResult<&str> {
    metadata
        .client_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or(ServiceError::InvalidMetadata { field: "client_id" })
}
