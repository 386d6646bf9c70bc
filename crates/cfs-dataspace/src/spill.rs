use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use cfs_types::{DataStream, StorageError};
use tracing::debug;

use crate::config::DataSpaceConfig;

enum Backing {
    Memory(Cursor<Vec<u8>>),
    File(File),
}

/// A staging stream that starts in memory and moves to an anonymous
/// temporary file once it grows past the high-water mark.
///
/// Truncating a file-backed stream to the low-water mark or below moves it
/// back into memory.
pub struct SpillStream {
    backing: Backing,
    high_water: u64,
    low_water: u64,
}

impl SpillStream {
    pub fn new(config: &DataSpaceConfig) -> Self {
        Self::with_marks(config.spill_high_water, config.spill_low_water)
    }

    pub fn with_marks(high_water: u64, low_water: u64) -> Self {
        Self {
            backing: Backing::Memory(Cursor::new(Vec::new())),
            high_water,
            low_water: low_water.min(high_water),
        }
    }

    /// Whether the content currently lives in a temporary file.
    pub fn is_spilled(&self) -> bool {
        matches!(self.backing, Backing::File(_))
    }

    fn backing(&mut self) -> &mut dyn DataStream {
        match &mut self.backing {
            Backing::Memory(cursor) => cursor,
            Backing::File(file) => file,
        }
    }

    fn spill(&mut self) -> io::Result<()> {
        let Backing::Memory(cursor) = &mut self.backing else {
            return Ok(());
        };
        let position = cursor.position();
        let mut file = tempfile::tempfile()?;
        file.write_all(cursor.get_ref())?;
        file.seek(SeekFrom::Start(position))?;
        debug!(bytes = cursor.get_ref().len(), "staging spilled to temporary file");
        self.backing = Backing::File(file);
        Ok(())
    }

    fn unspill(&mut self) -> io::Result<()> {
        let Backing::File(file) = &mut self.backing else {
            return Ok(());
        };
        let position = file.stream_position()?;
        let mut data = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut data)?;
        let mut cursor = Cursor::new(data);
        cursor.set_position(position);
        self.backing = Backing::Memory(cursor);
        Ok(())
    }
}

impl Read for SpillStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.backing().read(buf)
    }
}

impl Write for SpillStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Backing::Memory(cursor) = &self.backing {
            let end = cursor
                .position()
                .checked_add(buf.len() as u64)
                .ok_or_else(|| {
                    io::Error::from(StorageError::Argument(format!(
                        "write of {} bytes at offset {}",
                        buf.len(),
                        cursor.position()
                    )))
                })?;
            if end > self.high_water {
                self.spill()?;
            }
        }
        self.backing().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.backing().flush()
    }
}

impl Seek for SpillStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.backing().seek(pos)
    }
}

impl DataStream for SpillStream {
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
        self.backing().length()
    }

    fn set_length(&mut self, len: u64) -> io::Result<()> {
        if len > self.high_water && !self.is_spilled() {
            self.spill()?;
        }
        self.backing().set_length(len)?;
        if len <= self.low_water && self.is_spilled() {
            self.unspill()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_content_stays_in_memory() {
        let mut stream = SpillStream::with_marks(64, 16);
        stream.write_all(&[1u8; 64]).unwrap();
        assert!(!stream.is_spilled());
        assert_eq!(stream.length().unwrap(), 64);
    }

    #[test]
    fn crossing_high_water_spills_and_keeps_content() {
        let mut stream = SpillStream::with_marks(64, 16);
        stream.write_all(&[1u8; 40]).unwrap();
        stream.write_all(&[2u8; 40]).unwrap();
        assert!(stream.is_spilled());
        assert_eq!(stream.stream_position().unwrap(), 80);

        stream.seek(SeekFrom::Start(0)).unwrap();
        let mut data = Vec::new();
        stream.read_to_end(&mut data).unwrap();
        assert_eq!(&data[..40], &[1u8; 40]);
        assert_eq!(&data[40..], &[2u8; 40]);
    }

    #[test]
    fn truncating_below_low_water_returns_to_memory() {
        let mut stream = SpillStream::with_marks(64, 16);
        stream.write_all(&[9u8; 100]).unwrap();
        assert!(stream.is_spilled());
        stream.set_length(10).unwrap();
        assert!(!stream.is_spilled());
        stream.seek(SeekFrom::Start(0)).unwrap();
        let mut data = Vec::new();
        stream.read_to_end(&mut data).unwrap();
        assert_eq!(data, vec![9u8; 10]);
    }

    #[test]
    fn extending_past_high_water_spills() {
        let mut stream = SpillStream::with_marks(64, 16);
        stream.set_length(65).unwrap();
        assert!(stream.is_spilled());
        assert_eq!(stream.length().unwrap(), 65);
    }

    #[test]
    fn write_end_overflow_rejected() {
        let mut stream = SpillStream::with_marks(64, 16);
        stream.seek(SeekFrom::Start(u64::MAX)).unwrap();
        let err = stream.write(b"x").unwrap_err();
        assert!(matches!(StorageError::from_io(err), StorageError::Argument(_)));
        assert!(!stream.is_spilled());
        assert_eq!(stream.length().unwrap(), 0);
    }

    #[test]
    fn config_marks() {
        let stream = SpillStream::new(&DataSpaceConfig::default());
        assert_eq!(stream.high_water, 10 * 1024 * 1024);
        assert_eq!(stream.low_water, 100 * 1024);
    }
}
