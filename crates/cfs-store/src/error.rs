use std::path::PathBuf;

use cfs_types::StorageError;

/// Errors from the in-memory provider's file snapshots.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The file is shorter than a header plus checksum.
    #[error("container file too short: {0} bytes")]
    Truncated(usize),

    #[error("invalid container magic: expected {expected:?}, got {actual:?}")]
    InvalidMagic { expected: String, actual: String },

    #[error("unsupported container snapshot version: {0}")]
    UnsupportedVersion(u32),

    /// Payload hash mismatch on read (data corruption).
    #[error("container checksum mismatch: stored {stored}, computed {computed}")]
    ChecksumMismatch { stored: String, computed: String },

    /// The payload decoded but describes an impossible tree.
    #[error("corrupt container payload: {0}")]
    CorruptPayload(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// No container file at the bound path.
    #[error("container file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// Failure inside the shared storage tree.
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for snapshot operations.
pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for StorageError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UnsupportedVersion(found) => StorageError::UnsupportedVersion {
                feature: "container snapshot".into(),
                required: found.to_string(),
                current: crate::snapshot::SNAPSHOT_VERSION.to_string(),
            },
            StoreError::FileNotFound(path) => StorageError::NotFound(path.display().to_string()),
            StoreError::Serialization(reason) => StorageError::Io(std::io::Error::other(reason)),
            StoreError::Storage(inner) => inner,
            StoreError::Io(e) => StorageError::from_io(e),
            corrupt => StorageError::CorruptFormat(corrupt.to_string()),
        }
    }
}
