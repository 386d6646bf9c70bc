use std::io::SeekFrom;

use cfs_types::StorageResult;
use serde::{Deserialize, Serialize};

/// Access granted when an element is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    pub fn can_read(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }

    /// Whether an element opened with `self` may be reopened with `requested`.
    pub fn permits(self, requested: AccessMode) -> bool {
        (!requested.can_read() || self.can_read()) && (!requested.can_write() || self.can_write())
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::ReadWrite => write!(f, "read-write"),
        }
    }
}

/// Whether an element is a stream or a storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementKind {
    Stream,
    Storage,
}

/// Size and type of one element.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElementStat {
    pub kind: ElementKind,
    /// Byte length for streams; zero for storages.
    pub size: u64,
}

/// One child of a storage, as reported by enumeration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElementInfo {
    /// The element name with its original casing.
    pub name: String,
    pub kind: ElementKind,
    pub size: u64,
}

/// A handle to one native stream.
///
/// Implementations own their position. Writes may in principle accept fewer
/// bytes than offered; callers must check the returned count.
pub trait NativeStream: Send {
    /// Read up to `buf.len()` bytes at the current position.
    fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize>;

    /// Write `buf` at the current position, returning the bytes accepted.
    fn write(&mut self, buf: &[u8]) -> StorageResult<usize>;

    /// Move the position and return the new absolute offset.
    fn seek(&mut self, pos: SeekFrom) -> StorageResult<u64>;

    /// Truncate or extend the stream.
    fn set_size(&mut self, size: u64) -> StorageResult<()>;

    /// Make pending writes visible to the owning storage.
    fn commit(&mut self) -> StorageResult<()>;

    fn stat(&self) -> StorageResult<ElementStat>;
}

/// A handle to one native storage (a folder-like node).
///
/// This is the boundary to the structured-storage implementation. Names are
/// single element names, never paths; lookups are case-insensitive and
/// enumeration reports the original casing.
pub trait NativeStorage: Send {
    /// Create a new stream. Fails with `AlreadyExists` if the name is taken.
    fn create_stream(&mut self, name: &str, mode: AccessMode)
        -> StorageResult<Box<dyn NativeStream>>;

    fn open_stream(&self, name: &str, mode: AccessMode) -> StorageResult<Box<dyn NativeStream>>;

    /// Create a new child storage. Fails with `AlreadyExists` if the name is taken.
    fn create_storage(&mut self, name: &str, mode: AccessMode)
        -> StorageResult<Box<dyn NativeStorage>>;

    fn open_storage(&self, name: &str, mode: AccessMode) -> StorageResult<Box<dyn NativeStorage>>;

    /// List the direct children of this storage.
    fn enumerate(&self) -> StorageResult<Vec<ElementInfo>>;

    /// Delete a child stream or storage (recursively).
    fn delete_element(&mut self, name: &str) -> StorageResult<()>;

    /// Persist changes made through this storage and its children.
    fn commit(&mut self) -> StorageResult<()>;

    /// Discard changes made since the last commit.
    fn revert(&mut self) -> StorageResult<()>;

    fn stat(&self) -> StorageResult<ElementStat>;

    fn access_mode(&self) -> AccessMode;

    /// Look up a child's type without opening it.
    fn element_kind(&self, name: &str) -> StorageResult<Option<ElementKind>> {
        let key = name_key(name);
        Ok(self
            .enumerate()?
            .into_iter()
            .find(|info| name_key(&info.name) == key)
            .map(|info| info.kind))
    }
}

/// Case-folded lookup key for an element name.
pub fn name_key(name: &str) -> String {
    name.to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_mode_capabilities() {
        assert!(AccessMode::Read.can_read());
        assert!(!AccessMode::Read.can_write());
        assert!(!AccessMode::Write.can_read());
        assert!(AccessMode::ReadWrite.can_read() && AccessMode::ReadWrite.can_write());
    }

    #[test]
    fn access_mode_permits() {
        assert!(AccessMode::ReadWrite.permits(AccessMode::Read));
        assert!(AccessMode::ReadWrite.permits(AccessMode::Write));
        assert!(!AccessMode::Read.permits(AccessMode::ReadWrite));
        assert!(!AccessMode::Write.permits(AccessMode::Read));
        assert!(AccessMode::Read.permits(AccessMode::Read));
    }

    #[test]
    fn name_key_is_case_insensitive() {
        assert_eq!(name_key("EUL-abc"), name_key("eul-ABC"));
        assert_ne!(name_key("a"), name_key("b"));
    }

    #[test]
    fn access_mode_display() {
        assert_eq!(AccessMode::ReadWrite.to_string(), "read-write");
    }
}
