use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use cfs_codec::BlockCodec;
use cfs_types::{DataStream, StorageError, StorageResult};
use tracing::{debug, warn};

use crate::config::DataSpaceConfig;
use crate::dictionary::StreamWithDictionary;
use crate::spill::SpillStream;
use crate::transform::{TransformInstance, TransformState};
use crate::versioned::VersionChecked;

/// Block-deflate compression. Always ready, with no settings to change.
pub struct CompressionTransform {
    instance: TransformInstance,
    state: TransformState,
}

impl CompressionTransform {
    pub fn new(instance: TransformInstance) -> Self {
        Self {
            instance,
            state: TransformState::Configured,
        }
    }

    pub fn instance(&self) -> &TransformInstance {
        &self.instance
    }

    pub fn state(&self) -> TransformState {
        self.state
    }

    pub fn produce_transformed_stream(
        &mut self,
        encoded: StreamWithDictionary,
        config: &DataSpaceConfig,
    ) -> StorageResult<Box<dyn DataStream>> {
        let codec = BlockCodec::with_block_size(config.compression_block_size)?;
        let stream = CompressingStream::new(encoded, codec, SpillStream::new(config));
        self.state = TransformState::StreamIssued;
        debug!(transform = %self.instance.name(), "compressed stream issued");
        Ok(Box::new(VersionChecked::new(
            Box::new(stream),
            Arc::clone(self.instance.primary()),
        )))
    }
}

/// Plaintext view over a block-compressed stream.
///
/// The encoded stream is inflated into a staging [`SpillStream`] on first
/// access. Changes are deflated back on flush, and on drop when the encoded
/// stream is still open.
pub struct CompressingStream {
    encoded: StreamWithDictionary,
    codec: BlockCodec,
    staging: SpillStream,
    loaded: bool,
    dirty: bool,
}

impl CompressingStream {
    pub fn new(encoded: StreamWithDictionary, codec: BlockCodec, staging: SpillStream) -> Self {
        Self {
            encoded,
            codec,
            staging,
            loaded: false,
            dirty: false,
        }
    }

    fn ensure_loaded(&mut self) -> StorageResult<()> {
        if self.loaded {
            return Ok(());
        }
        if self.encoded.length()? > 0 {
            self.codec.decompress(&mut self.encoded, &mut self.staging)?;
        }
        self.staging.seek(SeekFrom::Start(0))?;
        self.loaded = true;
        Ok(())
    }

    fn check_writable(&self) -> StorageResult<()> {
        if !self.encoded.can_write() {
            return Err(StorageError::NotSupported(
                "write to a compressed stream opened read-only".into(),
            ));
        }
        Ok(())
    }

    fn write_back(&mut self) -> StorageResult<()> {
        if !self.dirty {
            return Ok(());
        }
        self.codec.compress(&mut self.staging, &mut self.encoded)?;
        self.encoded.flush()?;
        self.dirty = false;
        Ok(())
    }
}

impl Read for CompressingStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_loaded()?;
        self.staging.read(buf)
    }
}

impl Write for CompressingStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_writable()?;
        self.ensure_loaded()?;
        let n = self.staging.write(buf)?;
        self.dirty |= n > 0;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.write_back()?)
    }
}

impl Seek for CompressingStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.ensure_loaded()?;
        self.staging.seek(pos)
    }
}

impl DataStream for CompressingStream {
    fn can_read(&self) -> bool {
        self.encoded.can_read()
    }

    fn can_write(&self) -> bool {
        self.encoded.can_write() && self.encoded.can_read()
    }

    fn can_seek(&self) -> bool {
        self.encoded.can_seek()
    }

    fn length(&mut self) -> io::Result<u64> {
        self.ensure_loaded()?;
        self.staging.length()
    }

    fn set_length(&mut self, len: u64) -> io::Result<()> {
        self.check_writable()?;
        self.ensure_loaded()?;
        self.staging.set_length(len)?;
        self.dirty = true;
        Ok(())
    }
}

impl Drop for CompressingStream {
    fn drop(&mut self) {
        if self.dirty && !self.encoded.is_disposed() {
            if let Err(e) = self.write_back() {
                warn!(error = %e, "compressed stream lost changes on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io::Cursor;
    use std::sync::Mutex;

    use cfs_store::{MemoryStorage, NativeStorage};
    use cfs_types::read_all;
    use rand::RngCore;

    use super::*;
    use crate::transform::TransformKind;
    use crate::versioned::VersionedStream;

    /// A cursor whose bytes stay observable after the stream is dropped.
    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Cursor<Vec<u8>>>>);

    impl Shared {
        fn contents(&self) -> Vec<u8> {
            self.0.lock().unwrap().get_ref().clone()
        }
    }

    impl Read for Shared {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.lock().unwrap().read(buf)
        }
    }

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for Shared {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.0.lock().unwrap().seek(pos)
        }
    }

    impl DataStream for Shared {
        fn can_read(&self) -> bool {
            true
        }

        fn can_write(&self) -> bool {
            true
        }

        fn can_seek(&self) -> bool {
            true
        }

        fn length(&mut self) -> io::Result<u64> {
            self.0.lock().unwrap().length()
        }

        fn set_length(&mut self, len: u64) -> io::Result<()> {
            self.0.lock().unwrap().set_length(len)
        }
    }

    fn transform() -> CompressionTransform {
        let primary = VersionedStream::new(
            Box::new(Cursor::new(Vec::new())),
            TransformKind::Compression.code_version(),
        )
        .into_shared();
        let storage: Box<dyn NativeStorage> = Box::new(MemoryStorage::new());
        CompressionTransform::new(TransformInstance::new("deflate", storage, primary))
    }

    fn encoded(backing: &Shared) -> StreamWithDictionary {
        StreamWithDictionary::new(Box::new(backing.clone()), BTreeMap::new())
    }

    #[test]
    fn starts_configured_then_fixed() {
        let mut t = transform();
        assert_eq!(t.state(), TransformState::Configured);
        let backing = Shared::default();
        t.produce_transformed_stream(encoded(&backing), &DataSpaceConfig::default())
            .unwrap();
        assert_eq!(t.state(), TransformState::StreamIssued);
    }

    #[test]
    fn flush_writes_block_stream() {
        let mut t = transform();
        let backing = Shared::default();
        let mut stream = t
            .produce_transformed_stream(encoded(&backing), &DataSpaceConfig::default())
            .unwrap();
        stream.write_all(b"abcd").unwrap();
        assert!(backing.contents().is_empty());
        stream.flush().unwrap();

        let stored = backing.contents();
        assert_eq!(&stored[0..4], &0x0FA0u32.to_le_bytes());
        assert_eq!(&stored[4..8], &4u32.to_le_bytes());

        let mut plain = Cursor::new(Vec::new());
        BlockCodec::new()
            .decompress(&mut Cursor::new(stored), &mut plain)
            .unwrap();
        assert_eq!(plain.into_inner(), b"abcd");
    }

    #[test]
    fn drop_writes_pending_changes() {
        let backing = Shared::default();
        let data = {
            let mut data = vec![0u8; 20_000];
            rand::thread_rng().fill_bytes(&mut data);
            data
        };
        {
            let mut stream = CompressingStream::new(
                encoded(&backing),
                BlockCodec::new(),
                SpillStream::with_marks(8 * 1024, 1024),
            );
            stream.write_all(&data).unwrap();
        }
        let mut reopened = CompressingStream::new(
            encoded(&backing),
            BlockCodec::new(),
            SpillStream::with_marks(8 * 1024, 1024),
        );
        assert_eq!(reopened.length().unwrap(), data.len() as u64);
        assert_eq!(read_all(&mut reopened).unwrap(), data);
    }

    #[test]
    fn edits_in_the_middle() {
        let backing = Shared::default();
        {
            let mut stream = CompressingStream::new(
                encoded(&backing),
                BlockCodec::new(),
                SpillStream::with_marks(1024, 256),
            );
            stream.write_all(&[b'a'; 10_000]).unwrap();
            stream.flush().unwrap();
            stream.seek(SeekFrom::Start(5_000)).unwrap();
            stream.write_all(b"XYZ").unwrap();
            stream.set_length(6_000).unwrap();
        }
        let mut reopened = CompressingStream::new(
            encoded(&backing),
            BlockCodec::new(),
            SpillStream::with_marks(1024, 256),
        );
        let content = read_all(&mut reopened).unwrap();
        assert_eq!(content.len(), 6_000);
        assert_eq!(&content[4_999..5_004], b"aXYZa");
    }

    #[test]
    fn read_only_encoded_rejects_writes() {
        struct ReadOnly(Cursor<Vec<u8>>);

        impl Read for ReadOnly {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                self.0.read(buf)
            }
        }

        impl Write for ReadOnly {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(StorageError::NotSupported("read-only".into()).into())
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        impl Seek for ReadOnly {
            fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
                self.0.seek(pos)
            }
        }

        impl DataStream for ReadOnly {
            fn can_read(&self) -> bool {
                true
            }

            fn can_write(&self) -> bool {
                false
            }

            fn can_seek(&self) -> bool {
                true
            }

            fn length(&mut self) -> io::Result<u64> {
                self.0.length()
            }

            fn set_length(&mut self, _len: u64) -> io::Result<()> {
                Err(StorageError::NotSupported("read-only".into()).into())
            }
        }

        let encoded = StreamWithDictionary::new(
            Box::new(ReadOnly(Cursor::new(Vec::new()))),
            BTreeMap::new(),
        );
        let mut stream =
            CompressingStream::new(encoded, BlockCodec::new(), SpillStream::with_marks(64, 16));
        let err = stream.write(b"x").unwrap_err();
        assert!(matches!(
            StorageError::from_io(err),
            StorageError::NotSupported(_)
        ));
        assert_eq!(stream.length().unwrap(), 0);
    }

    #[test]
    fn corrupt_encoded_stream_surfaces_on_first_read() {
        let backing = Shared::default();
        backing.clone().write_all(&[0xFF; 16]).unwrap();
        let mut stream = CompressingStream::new(
            encoded(&backing),
            BlockCodec::new(),
            SpillStream::with_marks(64, 16),
        );
        let mut buf = [0u8; 4];
        let err = stream.read(&mut buf).unwrap_err();
        assert!(matches!(
            StorageError::from_io(err),
            StorageError::CorruptFormat(_)
        ));
    }
}
