use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

/// A byte stream with queryable capabilities.
///
/// Every stream in the container stack (native element views, transform
/// outputs, staging buffers) implements this trait so layers compose
/// freely as `Box<dyn DataStream>`. Errors travel as `io::Error`; a
/// [`StorageError`](crate::StorageError) carried inside one is recovered with
/// [`StorageError::from_io`](crate::StorageError::from_io).
pub trait DataStream: Read + Write + Seek + Send {
    /// Whether reads are permitted.
    fn can_read(&self) -> bool;

    /// Whether writes are permitted.
    fn can_write(&self) -> bool;

    /// Whether the position can be changed.
    fn can_seek(&self) -> bool;

    /// Current length in bytes.
    fn length(&mut self) -> io::Result<u64>;

    /// Truncate or extend the stream.
    fn set_length(&mut self, len: u64) -> io::Result<()>;
}

impl<T: DataStream + ?Sized> DataStream for Box<T> {
    fn can_read(&self) -> bool {
        (**self).can_read()
    }

    fn can_write(&self) -> bool {
        (**self).can_write()
    }

    fn can_seek(&self) -> bool {
        (**self).can_seek()
    }

    fn length(&mut self) -> io::Result<u64> {
        (**self).length()
    }

    fn set_length(&mut self, len: u64) -> io::Result<()> {
        (**self).set_length(len)
    }
}

impl DataStream for Cursor<Vec<u8>> {
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
        Ok(self.get_ref().len() as u64)
    }

    fn set_length(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length too large"))?;
        self.get_mut().resize(len, 0);
        Ok(())
    }
}

impl DataStream for File {
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
        Ok(self.metadata()?.len())
    }

    fn set_length(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Read until `buf` is full or the stream reports end of input.
///
/// Returns the number of bytes read; fewer than `buf.len()` means end of
/// input was reached.
pub fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Read the whole stream from position 0, restoring the position afterwards.
pub fn read_all(stream: &mut dyn DataStream) -> io::Result<Vec<u8>> {
    let saved = stream.stream_position()?;
    stream.seek(SeekFrom::Start(0))?;
    let mut data = Vec::new();
    stream.read_to_end(&mut data)?;
    stream.seek(SeekFrom::Start(saved))?;
    Ok(data)
}
