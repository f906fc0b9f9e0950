//! Error types for the storage subsystem.

use thiserror::Error;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error variants for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The filename cannot be used inside a flat mount directory.
    #[error("Invalid filename {name:?}: {reason}")]
    InvalidName {
        /// The rejected filename.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The path exists but is not a regular file.
    #[error("Not a regular file: {name}")]
    NotRegularFile {
        /// The offending filename.
        name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_from_std() {
        let std_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let storage_err = StorageError::from(std_err);
        assert!(matches!(storage_err, StorageError::IoError(_)));
    }

    #[test]
    fn test_invalid_name_display() {
        let err = StorageError::InvalidName {
            name: "../etc".to_string(),
            reason: "contains a path separator",
        };
        let msg = err.to_string();
        assert!(msg.contains("../etc"));
        assert!(msg.contains("path separator"));
    }

    #[test]
    fn test_not_regular_file_display() {
        let err = StorageError::NotRegularFile {
            name: "subdir".to_string(),
        };
        assert_eq!(err.to_string(), "Not a regular file: subdir");
    }
}
