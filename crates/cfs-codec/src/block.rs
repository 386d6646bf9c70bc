//! Block framing.
//!
//! Each block is a 12-byte header followed by the deflate payload:
//! ```text
//! [4 bytes: token 0x0FA0 (u32 LE)]
//! [4 bytes: uncompressed size (u32 LE)]
//! [4 bytes: compressed size (u32 LE)]
//! [compressed size bytes: payload]
//! ```

use std::io::{Read, Write};

use cfs_types::read_full;

use crate::error::{CodecError, CodecResult};

/// Marker that opens every block header.
pub const BLOCK_TOKEN: u32 = 0x0FA0;

/// Upper bound for both size fields of a header.
pub const MAX_BLOCK_SIZE: u32 = 0xFFFFF;

pub const HEADER_SIZE: usize = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub uncompressed_size: u32,
    pub compressed_size: u32,
}

impl BlockHeader {
    /// Build a header, rejecting sizes above [`MAX_BLOCK_SIZE`].
    pub fn new(uncompressed_size: usize, compressed_size: usize) -> CodecResult<Self> {
        let fits = |n: usize| u32::try_from(n).ok().filter(|&n| n <= MAX_BLOCK_SIZE);
        match (fits(uncompressed_size), fits(compressed_size)) {
            (Some(uncompressed_size), Some(compressed_size)) => Ok(Self {
                uncompressed_size,
                compressed_size,
            }),
            _ => Err(CodecError::InvalidOperation(format!(
                "block sizes {uncompressed_size}/{compressed_size} exceed {MAX_BLOCK_SIZE:#x}"
            ))),
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&BLOCK_TOKEN.to_le_bytes());
        out[4..8].copy_from_slice(&self.uncompressed_size.to_le_bytes());
        out[8..12].copy_from_slice(&self.compressed_size.to_le_bytes());
        out
    }

    /// Decode and validate a header.
    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> CodecResult<Self> {
        let field =
            |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let token = field(0);
        if token != BLOCK_TOKEN {
            return Err(CodecError::Corrupt(format!(
                "bad block token {token:#x}, expected {BLOCK_TOKEN:#x}"
            )));
        }
        let header = Self {
            uncompressed_size: field(4),
            compressed_size: field(8),
        };
        if header.uncompressed_size > MAX_BLOCK_SIZE || header.compressed_size > MAX_BLOCK_SIZE {
            return Err(CodecError::Corrupt(format!(
                "block sizes {}/{} exceed {MAX_BLOCK_SIZE:#x}",
                header.uncompressed_size, header.compressed_size
            )));
        }
        if header.uncompressed_size == 0 || header.compressed_size == 0 {
            return Err(CodecError::Corrupt("zero-length block".into()));
        }
        Ok(header)
    }

    /// Read the next header. `None` means the stream ended cleanly between blocks.
    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> CodecResult<Option<Self>> {
        let mut bytes = [0u8; HEADER_SIZE];
        match read_full(reader, &mut bytes)? {
            0 => Ok(None),
            HEADER_SIZE => Self::parse(&bytes).map(Some),
            n => Err(CodecError::Corrupt(format!(
                "truncated block header: {n} of {HEADER_SIZE} bytes"
            ))),
        }
    }

    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> CodecResult<()> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }
}
