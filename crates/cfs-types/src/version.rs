//! Feature version records that gate reading and updating persisted data.
//!
//! On-disk format:
//! ```text
//! [length-prefixed UTF-16 feature name, padded to 4 bytes]
//! [2 bytes: reader major]  [2 bytes: reader minor]
//! [2 bytes: updater major] [2 bytes: updater minor]
//! [2 bytes: writer major]  [2 bytes: writer minor]
//! ```

use std::fmt;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};
use crate::wire;

/// A `(major, minor)` version, ordered lexicographically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionPair {
    pub major: u16,
    pub minor: u16,
}

impl VersionPair {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    fn save<W: Write + ?Sized>(&self, writer: &mut W) -> StorageResult<usize> {
        Ok(wire::write_u16(writer, self.major)? + wire::write_u16(writer, self.minor)?)
    }

    fn load<R: Read + ?Sized>(reader: &mut R) -> StorageResult<Self> {
        let major = wire::read_u16(reader)?;
        let minor = wire::read_u16(reader)?;
        Ok(Self { major, minor })
    }
}

impl fmt::Display for VersionPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// The version record of one persisted feature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatVersion {
    /// Identifies the feature this record governs.
    pub feature: String,
    /// Oldest code version that may read the data.
    pub minimum_reader: VersionPair,
    /// Oldest code version that may modify the data.
    pub minimum_updater: VersionPair,
    /// Version of the code that last wrote the data.
    pub current: VersionPair,
}

impl FormatVersion {
    /// A record where reader, updater and writer versions are all `version`.
    pub fn uniform(feature: impl Into<String>, version: VersionPair) -> Self {
        Self {
            feature: feature.into(),
            minimum_reader: version,
            minimum_updater: version,
            current: version,
        }
    }

    /// Size in bytes of the serialized record.
    pub fn encoded_len(&self) -> usize {
        wire::utf16_string_size(&self.feature) + 12
    }

    pub fn save<W: Write + ?Sized>(&self, writer: &mut W) -> StorageResult<usize> {
        let mut written = wire::write_utf16_string(writer, &self.feature)?;
        written += self.minimum_reader.save(writer)?;
        written += self.minimum_updater.save(writer)?;
        written += self.current.save(writer)?;
        Ok(written)
    }

    /// Deserialize a record. Returns the record and bytes consumed.
    pub fn load<R: Read + ?Sized>(reader: &mut R) -> StorageResult<(Self, usize)> {
        let (feature, used) = wire::read_utf16_string(reader)?;
        if feature.is_empty() {
            return Err(StorageError::corrupt("version record has no feature name"));
        }
        let minimum_reader = VersionPair::load(reader)?;
        let minimum_updater = VersionPair::load(reader)?;
        let current = VersionPair::load(reader)?;
        let version = Self {
            feature,
            minimum_reader,
            minimum_updater,
            current,
        };
        Ok((version, used + 12))
    }

    /// Fail unless code at version `code` may read data carrying this record.
    pub fn check_readable_by(&self, code: VersionPair) -> StorageResult<()> {
        if self.minimum_reader > code {
            return Err(StorageError::UnsupportedVersion {
                feature: self.feature.clone(),
                required: self.minimum_reader.to_string(),
                current: code.to_string(),
            });
        }
        Ok(())
    }

    /// Fail unless code at version `code` may update data carrying this record.
    pub fn check_updatable_by(&self, code: VersionPair) -> StorageResult<()> {
        if self.minimum_updater > code {
            return Err(StorageError::UnsupportedVersion {
                feature: self.feature.clone(),
                required: self.minimum_updater.to_string(),
                current: code.to_string(),
            });
        }
        Ok(())
    }

    /// The record to persist after `code` updates data carrying this record.
    ///
    /// Minimums never decrease; the writer version becomes the code's.
    pub fn updated_by(&self, code: &FormatVersion) -> FormatVersion {
        FormatVersion {
            feature: self.feature.clone(),
            minimum_reader: self.minimum_reader.max(code.minimum_reader),
            minimum_updater: self.minimum_updater.max(code.minimum_updater),
            current: code.current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> FormatVersion {
        FormatVersion {
            feature: "Feature.Sample".into(),
            minimum_reader: VersionPair::new(1, 0),
            minimum_updater: VersionPair::new(1, 2),
            current: VersionPair::new(2, 5),
        }
    }

    #[test]
    fn save_load_roundtrip() {
        let version = sample();
        let mut buf = Vec::new();
        let written = version.save(&mut buf).unwrap();
        assert_eq!(written, version.encoded_len());
        let (loaded, consumed) = FormatVersion::load(&mut Cursor::new(buf)).unwrap();
        assert_eq!(loaded, version);
        assert_eq!(consumed, written);
    }

    #[test]
    fn fixed_tail_layout() {
        let version = sample();
        let mut buf = Vec::new();
        version.save(&mut buf).unwrap();
        let tail = &buf[buf.len() - 12..];
        assert_eq!(tail, &[1, 0, 0, 0, 1, 0, 2, 0, 2, 0, 5, 0]);
    }

    #[test]
    fn pair_ordering() {
        assert!(VersionPair::new(1, 9) < VersionPair::new(2, 0));
        assert!(VersionPair::new(2, 1) > VersionPair::new(2, 0));
        assert_eq!(VersionPair::new(3, 4).to_string(), "3.4");
    }

    #[test]
    fn readable_check() {
        let version = sample();
        assert!(version.check_readable_by(VersionPair::new(1, 0)).is_ok());
        let err = version
            .check_readable_by(VersionPair::new(0, 9))
            .unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedVersion { .. }));
    }

    #[test]
    fn updatable_check() {
        let version = sample();
        assert!(version.check_updatable_by(VersionPair::new(1, 2)).is_ok());
        assert!(version.check_updatable_by(VersionPair::new(1, 1)).is_err());
    }

    #[test]
    fn update_keeps_minimums() {
        let file = sample();
        let code = FormatVersion::uniform("Feature.Sample", VersionPair::new(1, 1));
        let updated = file.updated_by(&code);
        assert_eq!(updated.minimum_reader, VersionPair::new(1, 1));
        assert_eq!(updated.minimum_updater, VersionPair::new(1, 2));
        assert_eq!(updated.current, VersionPair::new(1, 1));
    }

    #[test]
    fn empty_feature_is_corrupt() {
        let mut buf = Vec::new();
        FormatVersion::uniform("", VersionPair::new(1, 0))
            .save(&mut buf)
            .unwrap();
        let err = FormatVersion::load(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, StorageError::CorruptFormat(_)));
    }
}
