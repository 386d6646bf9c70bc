use flate2::{CompressError, DecompressError, Status};

use crate::error::{CodecError, CodecResult};

/// Outcome of one deflate or inflate call, in zlib's vocabulary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZlibStatus {
    Ok,
    StreamEnd,
    NeedDictionary,
    BufError,
    StreamError,
    DataError,
    MemError,
    VersionError,
}

impl ZlibStatus {
    pub fn from_compress(result: &Result<Status, CompressError>) -> Self {
        match result {
            Ok(status) => Self::from_status(*status),
            Err(_) => Self::StreamError,
        }
    }

    pub fn from_decompress(result: &Result<Status, DecompressError>) -> Self {
        match result {
            Ok(status) => Self::from_status(*status),
            Err(e) if e.needs_dictionary().is_some() => Self::NeedDictionary,
            Err(_) => Self::DataError,
        }
    }

    fn from_status(status: Status) -> Self {
        match status {
            Status::Ok => Self::Ok,
            Status::StreamEnd => Self::StreamEnd,
            Status::BufError => Self::BufError,
        }
    }

    /// Map a non-`Ok` status onto the codec error taxonomy.
    ///
    /// A block is always processed with one sync flush, so reaching the end
    /// of the stream or running out of buffer means the codec was misused.
    pub fn check(self, operation: &str) -> CodecResult<()> {
        match self {
            Self::Ok => Ok(()),
            Self::StreamEnd | Self::BufError => Err(CodecError::InvalidOperation(format!(
                "{operation} returned {self:?} inside a block"
            ))),
            Self::NeedDictionary | Self::StreamError | Self::DataError => {
                Err(CodecError::Corrupt(format!("{operation} failed: {self:?}")))
            }
            Self::MemError => Err(CodecError::OutOfMemory),
            Self::VersionError => Err(CodecError::Io(std::io::Error::other(format!(
                "{operation} failed: {self:?}"
            )))),
        }
    }
}
