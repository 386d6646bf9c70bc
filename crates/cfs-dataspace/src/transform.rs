//! Transforms and their persisted definitions.
//!
//! Every transform lives in its own storage under `TransformInfo`:
//! ```text
//! "\u{6}Definition"  [4 bytes: header length (i32 LE), at least 8]
//!                    [4 bytes: class type (i32 LE), always 1]
//!                    [header length - 8 bytes: extra header, skipped]
//!                    [length-prefixed UTF-16 transform identifier]
//!                    [length-prefixed UTF-16 transform name]
//! "\u{6}Primary"     version-gated instance data
//! ...                transform-owned streams
//! ```

use std::fmt;
use std::io::{Cursor, ErrorKind};

use cfs_store::{NativeStorage, NativeStream};
use cfs_types::{wire, DataStream, FormatVersion, StorageError, StorageResult, VersionPair};
use serde::{Deserialize, Serialize};

use crate::compression::CompressionTransform;
use crate::config::DataSpaceConfig;
use crate::dictionary::StreamWithDictionary;
use crate::encryption::RightsManagementEncryptionTransform;
use crate::versioned::SharedVersionedStream;

/// Name of the definition stream inside a transform storage.
pub const DEFINITION_STREAM: &str = "\u{6}Definition";

/// Name of the primary instance-data stream inside a transform storage.
pub const PRIMARY_STREAM: &str = "\u{6}Primary";

const DEFINITION_HEADER_LEN: i32 = 8;
const TRANSFORM_CLASS_TYPE: i32 = 1;

/// The transforms this crate implements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransformKind {
    Compression,
    RightsManagementEncryption,
}

impl TransformKind {
    /// Persisted identifier of the transform class.
    pub fn identifier(self) -> &'static str {
        match self {
            Self::Compression => "{86DE7F2B-DDCE-486d-B016-405BBE82B8BC}",
            Self::RightsManagementEncryption => "{C73DFACD-061F-43B0-8B64-0C620D2A8B50}",
        }
    }

    /// Feature name of the version record in the primary instance data.
    pub fn feature(self) -> &'static str {
        match self {
            Self::Compression => "Microsoft.Metadata.CompressionTransform",
            Self::RightsManagementEncryption => "Microsoft.Metadata.DRMTransform",
        }
    }

    pub fn code_version(self) -> FormatVersion {
        FormatVersion::uniform(self.feature(), VersionPair::new(1, 0))
    }

    /// Look up a kind by identifier; GUID case is not significant.
    pub fn from_identifier(identifier: &str) -> Option<Self> {
        [Self::Compression, Self::RightsManagementEncryption]
            .into_iter()
            .find(|kind| kind.identifier().eq_ignore_ascii_case(identifier))
    }
}

impl fmt::Display for TransformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compression => f.write_str("compression"),
            Self::RightsManagementEncryption => f.write_str("rights-management encryption"),
        }
    }
}

/// Lifecycle of a transform. There is no way back to an earlier state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransformState {
    /// Not ready: required settings are missing.
    Constructed,
    /// Ready; settings may still change.
    Configured,
    /// Ready; a stream was produced, so settings are fixed.
    StreamIssued,
}

/// Per-transform persistent state: its storage and primary instance data.
pub struct TransformInstance {
    name: String,
    storage: Box<dyn NativeStorage>,
    primary: SharedVersionedStream,
}

impl TransformInstance {
    pub fn new(
        name: impl Into<String>,
        storage: Box<dyn NativeStorage>,
        primary: SharedVersionedStream,
    ) -> Self {
        Self {
            name: name.into(),
            storage,
            primary,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage(&self) -> &dyn NativeStorage {
        self.storage.as_ref()
    }

    pub fn storage_mut(&mut self) -> &mut dyn NativeStorage {
        self.storage.as_mut()
    }

    pub fn primary(&self) -> &SharedVersionedStream {
        &self.primary
    }
}

/// A configured transform of one of the supported kinds.
pub enum DataSpaceTransform {
    Compression(CompressionTransform),
    RightsManagementEncryption(RightsManagementEncryptionTransform),
}

impl DataSpaceTransform {
    pub fn new(kind: TransformKind, instance: TransformInstance) -> Self {
        match kind {
            TransformKind::Compression => Self::Compression(CompressionTransform::new(instance)),
            TransformKind::RightsManagementEncryption => {
                Self::RightsManagementEncryption(RightsManagementEncryptionTransform::new(instance))
            }
        }
    }

    fn instance(&self) -> &TransformInstance {
        match self {
            Self::Compression(t) => t.instance(),
            Self::RightsManagementEncryption(t) => t.instance(),
        }
    }

    pub fn name(&self) -> &str {
        self.instance().name()
    }

    pub fn kind(&self) -> TransformKind {
        match self {
            Self::Compression(_) => TransformKind::Compression,
            Self::RightsManagementEncryption(_) => TransformKind::RightsManagementEncryption,
        }
    }

    pub fn transform_identifier(&self) -> &'static str {
        self.kind().identifier()
    }

    pub fn state(&self) -> TransformState {
        match self {
            Self::Compression(t) => t.state(),
            Self::RightsManagementEncryption(t) => t.state(),
        }
    }

    /// Whether the transform can produce streams.
    pub fn is_ready(&self) -> bool {
        self.state() != TransformState::Constructed
    }

    /// Whether settings can no longer change.
    pub fn fixed_settings(&self) -> bool {
        match self {
            Self::Compression(_) => true,
            Self::RightsManagementEncryption(t) => t.state() == TransformState::StreamIssued,
        }
    }

    /// Wrap `encoded` (the stored form) in a stream presenting the logical content.
    pub fn produce_transformed_stream(
        &mut self,
        encoded: StreamWithDictionary,
        config: &DataSpaceConfig,
    ) -> StorageResult<Box<dyn DataStream>> {
        match self {
            Self::Compression(t) => t.produce_transformed_stream(encoded, config),
            Self::RightsManagementEncryption(t) => t.produce_transformed_stream(encoded),
        }
    }

    pub fn as_rights_management_mut(&mut self) -> Option<&mut RightsManagementEncryptionTransform> {
        match self {
            Self::RightsManagementEncryption(t) => Some(t),
            Self::Compression(_) => None,
        }
    }
}

impl fmt::Debug for DataSpaceTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSpaceTransform")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) fn not_ready(name: &str, kind: TransformKind) -> StorageError {
    StorageError::InvalidOperation(format!("{kind} transform {name:?} is not ready"))
}

/// The contents of a `"\u{6}Definition"` stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct TransformDefinition {
    pub kind: TransformKind,
    pub name: String,
}

impl TransformDefinition {
    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        let mut out = Vec::new();
        wire::write_i32(&mut out, DEFINITION_HEADER_LEN)?;
        wire::write_i32(&mut out, TRANSFORM_CLASS_TYPE)?;
        wire::write_utf16_string(&mut out, self.kind.identifier())?;
        wire::write_utf16_string(&mut out, &self.name)?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> StorageResult<Self> {
        let mut reader = Cursor::new(bytes);
        let header_len = wire::read_length(&mut reader, "transform header length")?;
        if header_len < DEFINITION_HEADER_LEN as usize {
            return Err(StorageError::corrupt(format!(
                "transform header length {header_len} below {DEFINITION_HEADER_LEN}"
            )));
        }
        let class_type = wire::read_i32(&mut reader)?;
        if class_type != TRANSFORM_CLASS_TYPE {
            return Err(StorageError::corrupt(format!(
                "unknown transform class type {class_type}"
            )));
        }
        wire::skip_bytes(
            &mut reader,
            header_len - DEFINITION_HEADER_LEN as usize,
            "transform header",
        )?;
        let (identifier, _) = wire::read_utf16_string(&mut reader)?;
        let (name, _) = wire::read_utf16_string(&mut reader)?;
        let kind = TransformKind::from_identifier(&identifier).ok_or_else(|| {
            StorageError::NotSupported(format!("transform class {identifier}"))
        })?;
        Ok(Self { kind, name })
    }
}

/// Read a whole native stream from its current position.
pub(crate) fn read_native(stream: &mut dyn NativeStream) -> StorageResult<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..n]);
    }
}

pub(crate) fn write_native(stream: &mut dyn NativeStream, mut bytes: &[u8]) -> StorageResult<()> {
    while !bytes.is_empty() {
        let n = stream.write(bytes)?;
        if n == 0 {
            return Err(StorageError::Io(ErrorKind::WriteZero.into()));
        }
        bytes = &bytes[n..];
    }
    stream.commit()
}
