use cfs_types::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("corrupt block stream: {0}")]
    Corrupt(String),

    #[error("codec misuse: {0}")]
    InvalidOperation(String),

    #[error("deflate engine out of memory")]
    OutOfMemory,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CodecResult<T> = Result<T, CodecError>;

impl From<CodecError> for StorageError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Corrupt(reason) => StorageError::CorruptFormat(reason),
            CodecError::InvalidOperation(reason) => StorageError::InvalidOperation(reason),
            CodecError::OutOfMemory => StorageError::OutOfMemory,
            CodecError::Io(e) => StorageError::from_io(e),
        }
    }
}
