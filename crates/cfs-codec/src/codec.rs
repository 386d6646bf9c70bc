use std::io::SeekFrom;

use cfs_types::{read_full, DataStream, StorageError, StorageResult};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use tracing::debug;

use crate::block::{BlockHeader, HEADER_SIZE, MAX_BLOCK_SIZE};
use crate::error::{CodecError, CodecResult};
use crate::status::ZlibStatus;

/// Default number of plaintext bytes per block.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Largest configurable block size; deflate output for a block this large
/// still fits in a header's compressed-size field.
pub const MAX_CONFIGURED_BLOCK_SIZE: usize = (MAX_BLOCK_SIZE as usize) / 2;

/// Compresses a stream into a sequence of independently framed deflate
/// blocks, and back.
///
/// The deflate state carries across blocks of one stream (one zlib stream,
/// sync-flushed at every block boundary), so blocks must be decoded in
/// order. Output is deterministic for a given input and block size.
#[derive(Clone, Copy, Debug)]
pub struct BlockCodec {
    block_size: usize,
}

impl Default for BlockCodec {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl BlockCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_block_size(block_size: usize) -> StorageResult<Self> {
        if block_size == 0 || block_size > MAX_CONFIGURED_BLOCK_SIZE {
            return Err(StorageError::Argument(format!(
                "block size {block_size} outside 1..={MAX_CONFIGURED_BLOCK_SIZE}"
            )));
        }
        Ok(Self { block_size })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Compress all of `source` into `sink`.
    ///
    /// Seekable streams are rewound to offset 0 first. A seekable sink is
    /// truncated to the bytes written, and a seekable source gets its
    /// original position back.
    pub fn compress(
        &self,
        source: &mut dyn DataStream,
        sink: &mut dyn DataStream,
    ) -> StorageResult<()> {
        let saved = rewind(source)?;
        rewind(sink)?;
        let written = self.compress_blocks(source, sink)?;
        finish(source, sink, saved, written)?;
        Ok(())
    }

    /// Decompress a block stream from `source` into `sink`.
    pub fn decompress(
        &self,
        source: &mut dyn DataStream,
        sink: &mut dyn DataStream,
    ) -> StorageResult<()> {
        let saved = rewind(source)?;
        rewind(sink)?;
        let written = decompress_blocks(source, sink)?;
        finish(source, sink, saved, written)?;
        Ok(())
    }

    fn compress_blocks(
        &self,
        source: &mut dyn DataStream,
        sink: &mut dyn DataStream,
    ) -> CodecResult<u64> {
        let chunk_len = if source.can_seek() {
            let len = source.length()?;
            usize::try_from(len).map_or(self.block_size, |len| len.min(self.block_size))
        } else {
            self.block_size
        };
        if chunk_len == 0 {
            return Ok(0);
        }

        let mut deflater = Compress::new(Compression::default(), true);
        let mut input = vec![0u8; chunk_len];
        let mut output = vec![0u8; chunk_len + chunk_len / 2 + 64];
        let mut written = 0u64;
        let mut blocks = 0usize;

        loop {
            let n = read_full(source, &mut input)?;
            if n == 0 {
                break;
            }

            let before_in = deflater.total_in();
            let before_out = deflater.total_out();
            let result = deflater.compress(&input[..n], &mut output, FlushCompress::Sync);
            ZlibStatus::from_compress(&result).check("deflate")?;
            let consumed = (deflater.total_in() - before_in) as usize;
            let produced = (deflater.total_out() - before_out) as usize;
            if consumed != n {
                return Err(CodecError::InvalidOperation(format!(
                    "deflate consumed {consumed} of {n} input bytes"
                )));
            }
            if produced == 0 {
                return Err(CodecError::InvalidOperation(
                    "deflate produced no output".into(),
                ));
            }

            BlockHeader::new(n, produced)?.write_to(sink)?;
            sink.write_all(&output[..produced])?;
            written += (HEADER_SIZE + produced) as u64;
            blocks += 1;
        }

        debug!(blocks, compressed = written, "stream compressed");
        Ok(written)
    }
}

fn decompress_blocks(source: &mut dyn DataStream, sink: &mut dyn DataStream) -> CodecResult<u64> {
    let mut inflater = Decompress::new(true);
    let mut written = 0u64;
    let mut blocks = 0usize;

    while let Some(header) = BlockHeader::read_from(source)? {
        let compressed_len = header.compressed_size as usize;
        let expected = header.uncompressed_size as usize;

        let mut input = vec![0u8; compressed_len];
        let got = read_full(source, &mut input)?;
        if got != compressed_len {
            return Err(CodecError::Corrupt(format!(
                "block payload truncated: {got} of {compressed_len} bytes"
            )));
        }

        // One spare byte so a block that inflates past its declared size is
        // detected instead of silently stopping at the buffer end.
        let mut output = vec![0u8; expected + 1];
        let before_in = inflater.total_in();
        let before_out = inflater.total_out();
        let result = inflater.decompress(&input, &mut output, FlushDecompress::Sync);
        ZlibStatus::from_decompress(&result).check("inflate")?;
        let consumed = (inflater.total_in() - before_in) as usize;
        let produced = (inflater.total_out() - before_out) as usize;
        if produced != expected {
            return Err(CodecError::Corrupt(format!(
                "block inflated to {produced} bytes, header declares {expected}"
            )));
        }
        if consumed != compressed_len {
            return Err(CodecError::Corrupt(format!(
                "inflate consumed {consumed} of {compressed_len} payload bytes"
            )));
        }

        sink.write_all(&output[..produced])?;
        written += produced as u64;
        blocks += 1;
    }

    debug!(blocks, decompressed = written, "stream decompressed");
    Ok(written)
}

/// Move a seekable stream to offset 0, returning its previous position.
fn rewind(stream: &mut dyn DataStream) -> CodecResult<Option<u64>> {
    if !stream.can_seek() {
        return Ok(None);
    }
    let position = stream.stream_position()?;
    stream.seek(SeekFrom::Start(0))?;
    Ok(Some(position))
}

fn finish(
    source: &mut dyn DataStream,
    sink: &mut dyn DataStream,
    saved: Option<u64>,
    written: u64,
) -> CodecResult<()> {
    sink.flush()?;
    if sink.can_seek() {
        sink.set_length(written)?;
    }
    if let Some(position) = saved {
        source.seek(SeekFrom::Start(position))?;
    }
    Ok(())
}
