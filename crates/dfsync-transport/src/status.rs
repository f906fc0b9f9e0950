//! Status vocabulary shared by every RPC.
//!
//! `AlreadyExists` doubles as the "content identical, skip transfer" signal.
//! It is a successful no-op for callers; see [`RpcStatus::is_already_synchronized`].

use serde::{Deserialize, Serialize};

/// Result code attached to every completed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// The call succeeded.
    Ok,
    /// The target file does not exist.
    NotFound,
    /// The call's deadline passed or its caller went away mid-operation.
    DeadlineExceeded,
    /// Another client holds the write lock.
    ResourceExhausted,
    /// The caller cancelled the call.
    Cancelled,
    /// Ownership violation, bad metadata, or an I/O failure.
    Internal,
    /// Content is identical on both sides; no transfer needed.
    AlreadyExists,
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StatusCode::Ok => "OK",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Internal => "INTERNAL",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
        };
        f.write_str(s)
    }
}

/// A non-OK status with a diagnostic message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcStatus {
    /// The status code.
    pub code: StatusCode,
    /// Human-readable detail, e.g. the wrapped filesystem error.
    pub message: String,
}

impl RpcStatus {
    /// Creates a status with the given code and message.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// `NOT_FOUND` status.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    /// `INTERNAL` status.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }

    /// `DEADLINE_EXCEEDED` status.
    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(StatusCode::DeadlineExceeded, message)
    }

    /// `RESOURCE_EXHAUSTED` status.
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(StatusCode::ResourceExhausted, message)
    }

    /// `CANCELLED` status.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Cancelled, message)
    }

    /// The distinguished "already synchronized" outcome.
    pub fn already_synchronized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::AlreadyExists, message)
    }

    /// True for the skip-transfer signal, which callers treat as success.
    pub fn is_already_synchronized(&self) -> bool {
        self.code == StatusCode::AlreadyExists
    }
}

impl std::fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcStatus {}

/// The terminal payload of every call.
pub type RpcReply<T> = Result<T, RpcStatus>;
