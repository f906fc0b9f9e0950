//! RPC message types for dfsync.
//!
//! Messages are serialized using bincode. Every call opens with a
//! [`CallEnvelope`] holding the out-of-band [`CallMetadata`] and the
//! bincode-encoded request body.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Serialize any serde-compatible message to bytes using bincode.
pub fn serialize_message<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    bincode::serialize(msg).map_err(|e| TransportError::SerializationError(e.to_string()))
}

/// Deserialize bytes to a message using bincode.
pub fn deserialize_message<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    bincode::deserialize(data).map_err(|e| TransportError::SerializationError(e.to_string()))
}

/// Per-call metadata carried outside the request body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallMetadata {
    /// Identifier of the calling client.
    pub client_id: Option<String>,
    /// Target filename.
    pub filename: Option<String>,
    /// CRC-32 of the caller's local copy.
    pub checksum: Option<u32>,
    /// Caller's local modification time, seconds since the epoch.
    pub mtime: Option<i64>,
    /// Call timeout in milliseconds, relative to when the server receives it.
    pub timeout_ms: Option<u64>,
}

impl CallMetadata {
    /// Metadata carrying only a client id.
    pub fn for_client(client_id: impl Into<String>) -> Self {
        Self {
            client_id: Some(client_id.into()),
            ..Default::default()
        }
    }

    /// Sets the filename.
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Sets the checksum.
    pub fn with_checksum(mut self, checksum: Option<u32>) -> Self {
        self.checksum = checksum;
        self
    }

    /// Sets the mtime.
    pub fn with_mtime(mut self, mtime: Option<i64>) -> Self {
        self.mtime = mtime;
        self
    }

    /// Sets the timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// First frame of every call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEnvelope {
    /// Out-of-band metadata.
    pub metadata: CallMetadata,
    /// Bincode-encoded request body.
    pub body: Vec<u8>,
}

/// Request naming one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRequest {
    /// Filename relative to the mount directory.
    pub name: String,
}

/// Acknowledgement for Store and Delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAck {
    /// Filename.
    pub name: String,
    /// Modification time after the operation (last known time for deletes).
    pub modified: i64,
}

/// Status of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStatus {
    /// Filename.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Creation time, seconds since the epoch.
    pub created: i64,
    /// Modification time, seconds since the epoch.
    pub modified: i64,
}

/// Directory listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileList {
    /// Every regular file, sorted by name.
    pub files: Vec<FileStatus>,
}

/// Empty request or reply body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty;
