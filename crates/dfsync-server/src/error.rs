use dfsync_storage::StorageError;
use dfsync_transport::{RpcStatus, StatusCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("file {name} does not exist")]
    NotFound { name: String },

    #[error("write lock on {name} is held by {holder}")]
    LockConflict { name: String, holder: String },

    #[error("client {client_id} does not hold the write lock on {name}")]
    OwnershipViolation { name: String, client_id: String },

    #[error("deadline exceeded: {reason}")]
    DeadlineExceeded { reason: String },

    #[error("{name} is already synchronized")]
    AlreadySynchronized { name: String },

    #[error("missing call metadata: {field}")]
    InvalidMetadata { field: &'static str },

    #[error("stream failed: {0}")]
    Stream(RpcStatus),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

impl ServiceError {
    /// Wire status for this error.
    pub fn status(&self) -> RpcStatus {
        let code = match self {
            ServiceError::NotFound { .. } => StatusCode::NotFound,
            ServiceError::LockConflict { .. } => StatusCode::ResourceExhausted,
            ServiceError::OwnershipViolation { .. } => StatusCode::Internal,
            ServiceError::DeadlineExceeded { .. } => StatusCode::DeadlineExceeded,
            ServiceError::AlreadySynchronized { .. } => StatusCode::AlreadyExists,
            ServiceError::InvalidMetadata { .. } => StatusCode::Internal,
            ServiceError::Stream(status) => return status.clone(),
            ServiceError::Storage(_) => StatusCode::Internal,
            ServiceError::Io(_) => StatusCode::Internal,
        };
        RpcStatus::new(code, self.to_string())
    }

    /// Status code only.
    pub fn code(&self) -> StatusCode {
        self.status().code
    }
}

impl From<RpcStatus> for ServiceError {
    fn from(status: RpcStatus) -> Self {
        match status.code {
            StatusCode::DeadlineExceeded | StatusCode::Cancelled => ServiceError::DeadlineExceeded {
                reason: status.message,
            },
            _ => ServiceError::Stream(status),
        }
    }
}
