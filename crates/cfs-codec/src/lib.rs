//! Deflate block codec for compound-file data spaces.
//!
//! A compressed stream is a sequence of framed blocks, each holding the
//! sync-flushed deflate output for one chunk of plaintext:
//!
//! - [`BlockHeader`] -- 12-byte frame header (token, uncompressed size,
//!   compressed size), validated before any payload is allocated
//! - [`BlockCodec`] -- compresses and decompresses whole streams
//! - [`ZlibStatus`] -- maps engine results onto the error taxonomy
//!
//! Codec failures are reported as [`CodecError`] internally and surface to
//! callers as [`cfs_types::StorageError`].

pub mod block;
pub mod codec;
pub mod error;
pub mod status;

pub use block::{BlockHeader, BLOCK_TOKEN, HEADER_SIZE, MAX_BLOCK_SIZE};
pub use codec::{BlockCodec, DEFAULT_BLOCK_SIZE, MAX_CONFIGURED_BLOCK_SIZE};
pub use error::{CodecError, CodecResult};
pub use status::ZlibStatus;
