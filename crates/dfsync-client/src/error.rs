use dfsync_storage::StorageError;
use dfsync_transport::{RpcStatus, StatusCode, TransportError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("server returned {0}")]
    Remote(RpcStatus),

    #[error("transport error: {0}")]
    Transport(TransportError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("local file {name} does not exist")]
    LocalMissing { name: String },

    #[error("file watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

impl From<TransportError> for ClientError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Status(status) => ClientError::Remote(status),
            other => ClientError::Transport(other),
        }
    }
}

impl ClientError {
    /// RPC status code to log for this failure.
    pub fn code(&self) -> StatusCode {
        match self {
            ClientError::Remote(status) => status.code,
            ClientError::Transport(TransportError::RequestTimeout { .. }) => StatusCode::DeadlineExceeded,
            ClientError::Transport(_) => StatusCode::Cancelled,
            ClientError::LocalMissing { .. } => StatusCode::NotFound,
            ClientError::Storage(_) | ClientError::Watch(_) | ClientError::Io(_) => StatusCode::Internal,
        }
    }

    /// True for a remote not-found.
    pub fn is_not_found(&self) -> bool {
        self.code() == StatusCode::NotFound
    }

    /// True when the connection itself failed, as opposed to a remote status.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, ClientError::Transport(_))
    }
}
