//! Foundation types for compound-file containers.
//!
//! This crate provides the path, reference, version and stream types used
//! throughout the workspace. Every other `cfs-*` crate depends on `cfs-types`.
//!
//! # Key Types
//!
//! - [`ContainerPath`] -- Validated backslash-delimited element path
//! - [`ElementReference`] -- Persistable reference to a stream or storage
//! - [`FormatVersion`] -- Reader/updater/writer version record for a feature
//! - [`DataStream`] -- Capability trait shared by every stream layer
//! - [`StorageError`] -- The error taxonomy for all container operations

pub mod error;
pub mod path;
pub mod reference;
pub mod stream;
pub mod version;
pub mod wire;

pub use error::{StorageError, StorageResult};
pub use path::{
    check_no_embedded_separator, is_reserved_name, validate_element_name, validate_native_name,
    ContainerPath, MAX_NAME_LEN, SEPARATOR,
};
pub use reference::{ElementReference, COMPONENT_STORAGE, COMPONENT_STREAM};
pub use stream::{read_all, read_full, DataStream};
pub use version::{FormatVersion, VersionPair};
