use std::io;

use thiserror::Error;

/// Errors produced anywhere in the container and data-space layers.
///
/// Every public operation in the workspace reports failures with one of these
/// variants. Parsing and decoding errors are raised eagerly; corrupt input is
/// permanent and never retried.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A logical path string is syntactically invalid.
    #[error("malformed path {path:?}: {reason}")]
    MalformedPath { path: String, reason: String },

    /// An element name contains a separator, reserved or forbidden character.
    #[error("invalid element name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    /// On-disk data violates a structural invariant.
    #[error("corrupt format: {0}")]
    CorruptFormat(String),

    /// The data was written by a newer, incompatible version of the format.
    #[error("unsupported version of {feature}: file requires {required}, code is {current}")]
    UnsupportedVersion {
        feature: String,
        required: String,
        current: String,
    },

    /// The resource (or the container that owns it) has been disposed.
    #[error("{0} has been disposed")]
    Disposed(&'static str),

    /// The operation is unavailable for the current access mode or seekability.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// A caller-supplied argument is invalid.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// The operation is invalid for the current object state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The named element does not exist.
    #[error("element not found: {0}")]
    NotFound(String),

    /// An element with this name already exists.
    #[error("element already exists: {0}")]
    AlreadyExists(String),

    /// Generic I/O or unexpected native-provider failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Allocation failure reported by a native codec. Not recoverable.
    #[error("out of memory")]
    OutOfMemory,
}

/// Result alias for container operations.
pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Shorthand for [`StorageError::CorruptFormat`].
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptFormat(reason.into())
    }

    /// Recover a `StorageError` that travelled through an `io::Error`.
    ///
    /// Streams implement `std::io::{Read, Write, Seek}`, so taxonomy errors
    /// are boxed into `io::Error` on the way out. This undoes that boxing;
    /// plain I/O errors become [`StorageError::Io`].
    pub fn from_io(err: io::Error) -> Self {
        if !err.get_ref().is_some_and(|inner| inner.is::<StorageError>()) {
            return Self::Io(err);
        }
        match err.into_inner().map(|inner| inner.downcast::<StorageError>()) {
            Some(Ok(storage)) => *storage,
            _ => Self::Io(io::Error::other("wrapped storage error was lost")),
        }
    }

    /// The `io::ErrorKind` used when this error is carried by an `io::Error`.
    fn io_kind(&self) -> io::ErrorKind {
        match self {
            Self::MalformedPath { .. } | Self::InvalidName { .. } | Self::Argument(_) => {
                io::ErrorKind::InvalidInput
            }
            Self::CorruptFormat(_) => io::ErrorKind::InvalidData,
            Self::NotSupported(_) => io::ErrorKind::Unsupported,
            Self::NotFound(_) => io::ErrorKind::NotFound,
            Self::AlreadyExists(_) => io::ErrorKind::AlreadyExists,
            Self::OutOfMemory => io::ErrorKind::OutOfMemory,
            _ => io::ErrorKind::Other,
        }
    }
}

impl From<StorageError> for io::Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(inner) => inner,
            other => io::Error::new(other.io_kind(), other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_survives_io_roundtrip() {
        let io_err: io::Error = StorageError::Disposed("stream").into();
        assert_eq!(io_err.kind(), io::ErrorKind::Other);
        let back = StorageError::from_io(io_err);
        assert!(matches!(back, StorageError::Disposed("stream")));
    }

    #[test]
    fn corrupt_maps_to_invalid_data() {
        let io_err: io::Error = StorageError::corrupt("bad token").into();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidData);
        assert!(matches!(
            StorageError::from_io(io_err),
            StorageError::CorruptFormat(msg) if msg == "bad token"
        ));
    }

    #[test]
    fn plain_io_error_is_wrapped_once() {
        let raw = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        let err = StorageError::from_io(raw);
        let io_err: io::Error = err.into();
        assert_eq!(io_err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn display_messages() {
        let err = StorageError::UnsupportedVersion {
            feature: "Feature".into(),
            required: "2.0".into(),
            current: "1.0".into(),
        };
        assert_eq!(
            err.to_string(),
            "unsupported version of Feature: file requires 2.0, code is 1.0"
        );
        assert_eq!(
            StorageError::Disposed("container").to_string(),
            "container has been disposed"
        );
    }
}
