use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Weak;

use cfs_types::{DataStream, StorageError, StorageResult};
use tracing::debug;

use crate::traits::{AccessMode, NativeStream};

/// A seekable byte stream over one native stream element.
///
/// The access mode is fixed when the stream is opened. The stream becomes
/// permanently unusable once [`dispose`](Self::dispose) is called or once the
/// owning [`Container`](crate::Container) is closed; every operation then
/// fails with [`StorageError::Disposed`]. The stream never keeps its
/// container alive.
pub struct ContainerStream {
    native: Option<Box<dyn NativeStream>>,
    mode: AccessMode,
    owner: Weak<()>,
    name: String,
}

impl ContainerStream {
    pub(crate) fn new(
        native: Box<dyn NativeStream>,
        mode: AccessMode,
        owner: Weak<()>,
        name: String,
    ) -> Self {
        Self {
            native: Some(native),
            mode,
            owner,
            name,
        }
    }

    /// The element path this stream was opened from.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn access_mode(&self) -> AccessMode {
        self.mode
    }

    /// Whether this stream or its container has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.native.is_none() || self.owner.strong_count() == 0
    }

    fn native(&mut self) -> StorageResult<&mut Box<dyn NativeStream>> {
        if self.owner.strong_count() == 0 {
            return Err(StorageError::Disposed("container"));
        }
        self.native.as_mut().ok_or(StorageError::Disposed("stream"))
    }

    fn check_disposed(&self) -> StorageResult<()> {
        if self.native.is_none() {
            return Err(StorageError::Disposed("stream"));
        }
        if self.owner.strong_count() == 0 {
            return Err(StorageError::Disposed("container"));
        }
        Ok(())
    }

    pub fn can_read(&self) -> bool {
        !self.is_disposed() && self.mode.can_read()
    }

    pub fn can_write(&self) -> bool {
        !self.is_disposed() && self.mode.can_write()
    }

    pub fn can_seek(&self) -> bool {
        !self.is_disposed()
    }

    /// Current size of the element in bytes.
    pub fn len(&mut self) -> StorageResult<u64> {
        Ok(self.native()?.stat()?.size)
    }

    pub fn is_empty(&mut self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn position(&mut self) -> StorageResult<u64> {
        self.check_disposed()?;
        if !self.can_seek() {
            return Err(StorageError::NotSupported("stream is not seekable".into()));
        }
        self.native()?.seek(SeekFrom::Current(0))
    }

    /// Move to an absolute offset.
    ///
    /// Fails with `Io` if the native element does not land exactly on
    /// `position`.
    pub fn set_position(&mut self, position: u64) -> StorageResult<()> {
        self.check_disposed()?;
        if !self.can_seek() {
            return Err(StorageError::NotSupported("stream is not seekable".into()));
        }
        let landed = self.native()?.seek(SeekFrom::Start(position))?;
        if landed != position {
            return Err(StorageError::Io(io::Error::other(format!(
                "seek to {position} landed at {landed}"
            ))));
        }
        Ok(())
    }

    /// Read up to `count` bytes into `buffer[offset..offset + count]`.
    pub fn read_region(
        &mut self,
        buffer: &mut [u8],
        offset: usize,
        count: usize,
    ) -> StorageResult<usize> {
        self.check_disposed()?;
        let end = region_end(buffer.len(), offset, count)?;
        if !self.mode.can_read() {
            return Err(StorageError::NotSupported(format!(
                "read from a stream opened for {}",
                self.mode
            )));
        }
        self.native()?.read(&mut buffer[offset..end])
    }

    /// Write exactly `buffer[offset..offset + count]`.
    ///
    /// A native element that accepts fewer bytes than requested is reported
    /// as `Io`.
    pub fn write_region(&mut self, buffer: &[u8], offset: usize, count: usize) -> StorageResult<()> {
        self.check_disposed()?;
        let end = region_end(buffer.len(), offset, count)?;
        if !self.mode.can_write() {
            return Err(StorageError::NotSupported(format!(
                "write to a stream opened for {}",
                self.mode
            )));
        }
        let written = self.native()?.write(&buffer[offset..end])?;
        if written != count {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("native stream accepted {written} of {count} bytes"),
            )));
        }
        Ok(())
    }

    /// Truncate or extend the element. The position is clamped to `len`.
    pub fn set_len(&mut self, len: u64) -> StorageResult<()> {
        self.check_disposed()?;
        if !self.mode.can_write() {
            return Err(StorageError::NotSupported(format!(
                "resize a stream opened for {}",
                self.mode
            )));
        }
        let native = self.native()?;
        let position = native.seek(SeekFrom::Current(0))?;
        native.set_size(len)?;
        if position > len {
            native.seek(SeekFrom::Start(len))?;
        }
        Ok(())
    }

    /// Commit pending writes to the native element.
    pub fn commit(&mut self) -> StorageResult<()> {
        self.native()?.commit()
    }

    /// Release the native handle. Calling this more than once is harmless.
    pub fn dispose(&mut self) {
        if self.native.take().is_some() {
            debug!(stream = %self.name, "container stream disposed");
        }
    }
}

fn region_end(buffer_len: usize, offset: usize, count: usize) -> StorageResult<usize> {
    match offset.checked_add(count) {
        Some(end) if end <= buffer_len => Ok(end),
        _ => Err(StorageError::Argument(format!(
            "offset {offset} + count {count} exceeds buffer length {buffer_len}"
        ))),
    }
}

impl Drop for ContainerStream {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for ContainerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerStream")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Read for ContainerStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len();
        Ok(self.read_region(buf, 0, len)?)
    }
}

impl Write for ContainerStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_region(buf, 0, buf.len())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.commit()?)
    }
}

impl Seek for ContainerStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position()?.checked_add_signed(delta),
            SeekFrom::End(delta) => self.len()?.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::from(StorageError::Argument(format!("seek to {pos:?} out of range")))
        })?;
        self.set_position(target)?;
        Ok(target)
    }
}

impl DataStream for ContainerStream {
    fn can_read(&self) -> bool {
        ContainerStream::can_read(self)
    }

    fn can_write(&self) -> bool {
        ContainerStream::can_write(self)
    }

    fn can_seek(&self) -> bool {
        ContainerStream::can_seek(self)
    }

    fn length(&mut self) -> io::Result<u64> {
        Ok(self.len()?)
    }

    fn set_length(&mut self, len: u64) -> io::Result<()> {
        Ok(self.set_len(len)?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::memory::MemoryStorage;
    use crate::traits::{ElementKind, ElementStat, NativeStorage};

    fn open_pair(content: &[u8], mode: AccessMode) -> (Arc<()>, ContainerStream) {
        let mut root = MemoryStorage::new();
        root.create_stream("s", AccessMode::ReadWrite)
            .unwrap()
            .write(content)
            .unwrap();
        let owner = Arc::new(());
        let native = root.open_stream("s", mode).unwrap();
        let stream = ContainerStream::new(native, mode, Arc::downgrade(&owner), "s".into());
        (owner, stream)
    }

    #[test]
    fn read_write_seek() {
        let (_owner, mut stream) = open_pair(b"", AccessMode::ReadWrite);
        stream.write_all(b"hello world").unwrap();
        assert_eq!(stream.len().unwrap(), 11);
        stream.set_position(6).unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"world");
        assert_eq!(stream.seek(SeekFrom::End(-5)).unwrap(), 6);
        assert_eq!(stream.seek(SeekFrom::Current(-6)).unwrap(), 0);
    }

    #[test]
    fn region_reads_into_offset() {
        let (_owner, mut stream) = open_pair(b"abcd", AccessMode::Read);
        let mut buf = [0u8; 6];
        assert_eq!(stream.read_region(&mut buf, 2, 4).unwrap(), 4);
        assert_eq!(&buf, b"\0\0abcd");
    }

    #[test]
    fn region_bounds_checked() {
        let (_owner, mut stream) = open_pair(b"abcd", AccessMode::ReadWrite);
        let mut buf = [0u8; 4];
        assert!(matches!(
            stream.read_region(&mut buf, 3, 2).unwrap_err(),
            StorageError::Argument(_)
        ));
        assert!(matches!(
            stream.write_region(&buf, usize::MAX, 2).unwrap_err(),
            StorageError::Argument(_)
        ));
    }

    #[test]
    fn read_only_stream_rejects_writes() {
        let (_owner, mut stream) = open_pair(b"abc", AccessMode::Read);
        assert!(stream.can_read());
        assert!(!stream.can_write());
        stream.set_position(2).unwrap();
        assert!(matches!(
            stream.write_region(b"x", 0, 1).unwrap_err(),
            StorageError::NotSupported(_)
        ));
        assert!(matches!(
            stream.set_len(0).unwrap_err(),
            StorageError::NotSupported(_)
        ));
        assert_eq!(stream.len().unwrap(), 3);
        assert_eq!(stream.position().unwrap(), 2);
    }

    #[test]
    fn write_at_huge_offset_is_rejected() {
        let (_owner, mut stream) = open_pair(b"", AccessMode::ReadWrite);
        stream.set_position(u64::MAX - 1).unwrap();
        assert!(matches!(
            stream.write_region(b"abcd", 0, 4).unwrap_err(),
            StorageError::Argument(_)
        ));
        assert_eq!(stream.len().unwrap(), 0);
        assert_eq!(stream.position().unwrap(), u64::MAX - 1);
    }

    #[test]
    fn write_only_stream_rejects_reads() {
        let (_owner, mut stream) = open_pair(b"abc", AccessMode::Write);
        let mut buf = [0u8; 1];
        assert!(matches!(
            stream.read_region(&mut buf, 0, 1).unwrap_err(),
            StorageError::NotSupported(_)
        ));
    }

    #[test]
    fn set_len_clamps_position() {
        let (_owner, mut stream) = open_pair(&[7u8; 100], AccessMode::ReadWrite);
        stream.set_position(80).unwrap();
        stream.set_len(50).unwrap();
        assert_eq!(stream.len().unwrap(), 50);
        assert_eq!(stream.position().unwrap(), 50);

        stream.set_position(10).unwrap();
        stream.set_len(40).unwrap();
        assert_eq!(stream.position().unwrap(), 10);
    }

    #[test]
    fn dispose_is_idempotent() {
        let (_owner, mut stream) = open_pair(b"abc", AccessMode::ReadWrite);
        stream.dispose();
        stream.dispose();
        assert!(stream.is_disposed());
        assert!(!stream.can_read() && !stream.can_write() && !stream.can_seek());
        assert!(matches!(
            stream.len().unwrap_err(),
            StorageError::Disposed("stream")
        ));
        let mut buf = [0u8; 1];
        let err = stream.read(&mut buf).unwrap_err();
        assert!(matches!(
            StorageError::from_io(err),
            StorageError::Disposed("stream")
        ));
    }

    #[test]
    fn dropped_owner_disposes_stream() {
        let (owner, mut stream) = open_pair(b"abc", AccessMode::ReadWrite);
        drop(owner);
        assert!(stream.is_disposed());
        assert!(matches!(
            stream.position().unwrap_err(),
            StorageError::Disposed("container")
        ));
    }

    /// Accepts at most half of every write.
    struct HalfWriter;

    impl NativeStream for HalfWriter {
        fn read(&mut self, _buf: &mut [u8]) -> StorageResult<usize> {
            Ok(0)
        }

        fn write(&mut self, buf: &[u8]) -> StorageResult<usize> {
            Ok(buf.len() / 2)
        }

        fn seek(&mut self, _pos: SeekFrom) -> StorageResult<u64> {
            Ok(0)
        }

        fn set_size(&mut self, _size: u64) -> StorageResult<()> {
            Ok(())
        }

        fn commit(&mut self) -> StorageResult<()> {
            Ok(())
        }

        fn stat(&self) -> StorageResult<ElementStat> {
            Ok(ElementStat {
                kind: ElementKind::Stream,
                size: 0,
            })
        }
    }

    #[test]
    fn partial_native_write_is_io_error() {
        let owner = Arc::new(());
        let mut stream = ContainerStream::new(
            Box::new(HalfWriter),
            AccessMode::ReadWrite,
            Arc::downgrade(&owner),
            "half".into(),
        );
        assert!(matches!(
            stream.write_region(b"abcd", 0, 4).unwrap_err(),
            StorageError::Io(_)
        ));
    }

    /// Seeks always land one byte short.
    struct DriftingSeek;

    impl NativeStream for DriftingSeek {
        fn read(&mut self, _buf: &mut [u8]) -> StorageResult<usize> {
            Ok(0)
        }

        fn write(&mut self, buf: &[u8]) -> StorageResult<usize> {
            Ok(buf.len())
        }

        fn seek(&mut self, pos: SeekFrom) -> StorageResult<u64> {
            match pos {
                SeekFrom::Start(n) => Ok(n.saturating_sub(1)),
                _ => Ok(0),
            }
        }

        fn set_size(&mut self, _size: u64) -> StorageResult<()> {
            Ok(())
        }

        fn commit(&mut self) -> StorageResult<()> {
            Ok(())
        }

        fn stat(&self) -> StorageResult<ElementStat> {
            Ok(ElementStat {
                kind: ElementKind::Stream,
                size: 10,
            })
        }
    }

    #[test]
    fn misplaced_seek_is_io_error() {
        let owner = Arc::new(());
        let mut stream = ContainerStream::new(
            Box::new(DriftingSeek),
            AccessMode::Read,
            Arc::downgrade(&owner),
            "drift".into(),
        );
        assert!(matches!(
            stream.set_position(5).unwrap_err(),
            StorageError::Io(_)
        ));
    }
}
