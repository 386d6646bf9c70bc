//! Structured storage for compound-file containers.
//!
//! A container is a tree of named storages (folders) and streams (byte
//! sequences) held inside one physical file. This crate defines the boundary
//! to the native structured-storage implementation and the container layer
//! built on top of it.
//!
//! # Layers
//!
//! - [`NativeStorage`] / [`NativeStream`] -- provider traits: create, open,
//!   enumerate, delete, commit, revert
//! - [`MemoryStorage`] -- in-memory provider, optionally bound to a file
//!   through a checksummed snapshot
//! - [`Container`] -- owns the root storage and resolves [`ContainerPath`]s
//! - [`ContainerStream`] -- access-checked, disposal-safe view over one
//!   native stream
//!
//! # Design Rules
//!
//! 1. Element names are compared case-insensitively and reported with their
//!    original casing.
//! 2. A stream never keeps its container alive; closing the container
//!    disposes every stream opened from it.
//! 3. Names starting with a control character are reserved for internal
//!    bookkeeping and hidden from listings.
//! 4. All I/O errors are propagated, never silently ignored.
//!
//! [`ContainerPath`]: cfs_types::ContainerPath

pub mod container;
pub mod error;
pub mod memory;
mod snapshot;
pub mod stream;
pub mod traits;

pub use container::Container;
pub use error::{StoreError, StoreResult};
pub use memory::{MemoryStorage, MemoryStream};
pub use stream::ContainerStream;
pub use traits::{
    name_key, AccessMode, ElementInfo, ElementKind, ElementStat, NativeStorage, NativeStream,
};
