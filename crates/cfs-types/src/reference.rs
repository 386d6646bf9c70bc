//! Persisted references to streams and storages.
//!
//! On-disk format:
//! ```text
//! [4 bytes: entry count (i32 LE)]
//! entry count x:
//!   [4 bytes: component type (i32 LE): 0 = stream, 1 = storage]
//!   [length-prefixed UTF-16 segment, padded to 4 bytes]
//! ```
//! Storage entries come first; a stream reference ends with exactly one
//! stream entry.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};
use crate::path::ContainerPath;
use crate::wire;

/// Component type tag for a stream segment.
pub const COMPONENT_STREAM: i32 = 0;
/// Component type tag for a storage segment.
pub const COMPONENT_STORAGE: i32 = 1;

/// A reference to a stream or a storage inside a container.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ElementReference {
    /// Targets a stream. The path has at least one segment.
    Stream(ContainerPath),
    /// Targets a storage. The root storage has an empty path.
    Storage(ContainerPath),
}

impl ElementReference {
    /// The referenced path.
    pub fn path(&self) -> &ContainerPath {
        match self {
            Self::Stream(path) | Self::Storage(path) => path,
        }
    }

    /// Returns `true` for stream references.
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }

    fn check_shape(&self) -> StorageResult<()> {
        if let Self::Stream(path) = self {
            if path.is_root() {
                return Err(StorageError::Argument(
                    "stream reference needs at least one path segment".into(),
                ));
            }
        }
        Ok(())
    }

    /// Size in bytes of the serialized form.
    pub fn encoded_len(&self) -> StorageResult<usize> {
        self.save(None)
    }

    /// Serialize the reference, returning the number of bytes produced.
    ///
    /// With `writer == None` nothing is written and only the size is
    /// computed, which callers use to size buffers ahead of time.
    pub fn save(&self, mut writer: Option<&mut dyn Write>) -> StorageResult<usize> {
        self.check_shape()?;
        let segments = self.path().segments();
        let count = i32::try_from(segments.len())
            .map_err(|_| StorageError::Argument("too many path segments".into()))?;

        let mut total = 4;
        if let Some(w) = writer.as_deref_mut() {
            wire::write_i32(w, count)?;
        }

        let last = segments.len().saturating_sub(1);
        for (i, segment) in segments.iter().enumerate() {
            let component = if self.is_stream() && i == last {
                COMPONENT_STREAM
            } else {
                COMPONENT_STORAGE
            };
            total += 4;
            match writer.as_deref_mut() {
                Some(w) => {
                    wire::write_i32(w, component)?;
                    total += wire::write_utf16_string(w, segment)?;
                }
                None => total += wire::utf16_string_size(segment),
            }
        }
        Ok(total)
    }

    /// Deserialize a reference. Returns the reference and bytes consumed.
    pub fn load<R: Read + ?Sized>(reader: &mut R) -> StorageResult<(Self, usize)> {
        let count = wire::read_i32(reader)?;
        if count < 0 {
            return Err(StorageError::corrupt(format!(
                "negative reference entry count {count}"
            )));
        }

        let mut consumed = 4;
        let mut storages = Vec::new();
        let mut stream: Option<String> = None;
        for _ in 0..count {
            let component = wire::read_i32(reader)?;
            let (segment, used) = wire::read_utf16_string(reader)?;
            consumed += 4 + used;
            match component {
                COMPONENT_STORAGE => {
                    if stream.is_some() {
                        return Err(StorageError::corrupt(
                            "storage entry follows a stream entry in reference",
                        ));
                    }
                    storages.push(segment);
                }
                COMPONENT_STREAM => {
                    if stream.is_some() {
                        return Err(StorageError::corrupt(
                            "more than one stream entry in reference",
                        ));
                    }
                    stream = Some(segment);
                }
                other => {
                    return Err(StorageError::corrupt(format!(
                        "unknown reference component type {other}"
                    )));
                }
            }
        }

        let is_stream = stream.is_some();
        storages.extend(stream);
        let path = ContainerPath::from_segments(storages)
            .map_err(|e| StorageError::corrupt(format!("invalid name in reference: {e}")))?;
        let reference = if is_stream {
            Self::Stream(path)
        } else {
            Self::Storage(path)
        };
        Ok((reference, consumed))
    }
}
