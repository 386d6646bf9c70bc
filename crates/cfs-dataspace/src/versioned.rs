//! Version-gated streams.
//!
//! A [`VersionedStream`] stores a [`FormatVersion`] record at offset 0 of its
//! inner stream and presents everything after it as logical content.
//! [`VersionChecked`] lets another stream (a transform's payload) trigger the
//! read and update checks of a shared `VersionedStream` without carrying a
//! header of its own.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use cfs_types::{DataStream, FormatVersion, StorageError, StorageResult};
use tracing::debug;

/// A `VersionedStream` shared between a transform and the streams it issues.
pub type SharedVersionedStream = Arc<Mutex<VersionedStream>>;

pub(crate) fn lock(shared: &Mutex<VersionedStream>) -> StorageResult<MutexGuard<'_, VersionedStream>> {
    shared
        .lock()
        .map_err(|_| StorageError::Io(io::Error::other("versioned stream lock poisoned")))
}

struct Header {
    version: FormatVersion,
    len: u64,
}

/// A stream whose first bytes are a format-version record.
///
/// The record is parsed on first access. Reading requires the code version
/// to satisfy the record's minimum reader version; the first write requires
/// the minimum updater version and then rewrites the record with the code's
/// version. An empty inner stream gets the code's record on first write.
/// A failed check leaves the inner stream untouched.
pub struct VersionedStream {
    inner: Box<dyn DataStream>,
    code: FormatVersion,
    header: Option<Header>,
    loaded: bool,
    read_checked: bool,
    update_checked: bool,
    position: u64,
}

impl VersionedStream {
    pub fn new(inner: Box<dyn DataStream>, code: FormatVersion) -> Self {
        Self {
            inner,
            code,
            header: None,
            loaded: false,
            read_checked: false,
            update_checked: false,
            position: 0,
        }
    }

    pub fn into_shared(self) -> SharedVersionedStream {
        Arc::new(Mutex::new(self))
    }

    /// The version this code reads and writes.
    pub fn code_version(&self) -> &FormatVersion {
        &self.code
    }

    /// The record stored in the stream, or `None` if nothing was written yet.
    pub fn file_version(&mut self) -> StorageResult<Option<FormatVersion>> {
        self.load()?;
        Ok(self.header.as_ref().map(|h| h.version.clone()))
    }

    fn load(&mut self) -> StorageResult<()> {
        if self.loaded {
            return Ok(());
        }
        if self.inner.length()? > 0 {
            self.inner.seek(SeekFrom::Start(0))?;
            let (version, len) = FormatVersion::load(&mut self.inner)?;
            if version.feature != self.code.feature {
                return Err(StorageError::corrupt(format!(
                    "version record names feature {:?}, expected {:?}",
                    version.feature, self.code.feature
                )));
            }
            self.header = Some(Header {
                version,
                len: len as u64,
            });
        }
        self.loaded = true;
        Ok(())
    }

    fn header_len(&self) -> u64 {
        self.header.as_ref().map_or(0, |h| h.len)
    }

    /// Fail unless this code may read the stream's content.
    pub fn check_read(&mut self) -> StorageResult<()> {
        if self.read_checked {
            return Ok(());
        }
        self.load()?;
        if let Some(header) = &self.header {
            header.version.check_readable_by(self.code.current)?;
        }
        self.read_checked = true;
        Ok(())
    }

    /// Fail unless this code may modify the stream, then stamp the record.
    pub fn check_update(&mut self) -> StorageResult<()> {
        if self.update_checked {
            return Ok(());
        }
        self.load()?;
        let record = match &self.header {
            Some(header) => {
                header.version.check_updatable_by(self.code.current)?;
                header.version.updated_by(&self.code)
            }
            None => self.code.clone(),
        };
        if self.header.as_ref().map(|h| &h.version) != Some(&record) {
            self.inner.seek(SeekFrom::Start(0))?;
            let len = record.save(&mut self.inner)? as u64;
            debug!(
                feature = %record.feature,
                version = %record.current,
                "version record written"
            );
            self.header = Some(Header {
                version: record,
                len,
            });
        }
        self.update_checked = true;
        Ok(())
    }

    /// Logical length: bytes after the version record.
    pub fn len(&mut self) -> StorageResult<u64> {
        self.load()?;
        Ok(self.inner.length()?.saturating_sub(self.header_len()))
    }

    pub fn is_empty(&mut self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn set_position(&mut self, position: u64) {
        self.position = position;
    }

    pub fn set_len(&mut self, len: u64) -> StorageResult<()> {
        self.check_update()?;
        let physical = self.physical(len)?;
        self.inner.set_length(physical)?;
        Ok(())
    }

    /// Offset in the inner stream of logical `offset`.
    fn physical(&self, offset: u64) -> StorageResult<u64> {
        self.header_len().checked_add(offset).ok_or_else(|| {
            StorageError::Argument(format!("logical offset {offset} out of range"))
        })
    }

    fn read_logical(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        self.check_read()?;
        if self.header.is_none() {
            return Ok(0);
        }
        let at = self.physical(self.position)?;
        self.inner.seek(SeekFrom::Start(at))?;
        let n = self.inner.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn write_logical(&mut self, buf: &[u8]) -> StorageResult<usize> {
        self.check_update()?;
        let at = self.physical(self.position)?;
        self.inner.seek(SeekFrom::Start(at))?;
        let n = self.inner.write(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Read for VersionedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_logical(buf)?)
    }
}

impl Write for VersionedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.write_logical(buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Seek for VersionedStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => self.len()?.checked_add_signed(delta),
        };
        self.position = target.ok_or_else(|| {
            io::Error::from(StorageError::Argument(format!("seek to {pos:?} out of range")))
        })?;
        Ok(self.position)
    }
}

impl DataStream for VersionedStream {
    fn can_read(&self) -> bool {
        self.inner.can_read()
    }

    fn can_write(&self) -> bool {
        self.inner.can_write()
    }

    fn can_seek(&self) -> bool {
        self.inner.can_seek()
    }

    fn length(&mut self) -> io::Result<u64> {
        Ok(self.len()?)
    }

    fn set_length(&mut self, len: u64) -> io::Result<()> {
        Ok(self.set_len(len)?)
    }
}

/// A payload stream gated by a shared [`VersionedStream`].
///
/// The first read (or length query) runs the owner's read check; the first
/// write or resize runs its update check.
pub struct VersionChecked {
    inner: Box<dyn DataStream>,
    owner: SharedVersionedStream,
    read_checked: bool,
    update_checked: bool,
}

impl VersionChecked {
    pub fn new(inner: Box<dyn DataStream>, owner: SharedVersionedStream) -> Self {
        Self {
            inner,
            owner,
            read_checked: false,
            update_checked: false,
        }
    }

    fn check_read(&mut self) -> StorageResult<()> {
        if !self.read_checked {
            lock(&self.owner)?.check_read()?;
            self.read_checked = true;
        }
        Ok(())
    }

    fn check_update(&mut self) -> StorageResult<()> {
        if !self.update_checked {
            lock(&self.owner)?.check_update()?;
            self.update_checked = true;
        }
        Ok(())
    }
}

impl Read for VersionChecked {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_read()?;
        self.inner.read(buf)
    }
}

impl Write for VersionChecked {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_update()?;
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Seek for VersionChecked {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        if matches!(pos, SeekFrom::End(_)) {
            self.check_read()?;
        }
        self.inner.seek(pos)
    }
}

impl DataStream for VersionChecked {
    fn can_read(&self) -> bool {
        self.inner.can_read()
    }

    fn can_write(&self) -> bool {
        self.inner.can_write()
    }

    fn can_seek(&self) -> bool {
        self.inner.can_seek()
    }

    fn length(&mut self) -> io::Result<u64> {
        self.check_read()?;
        self.inner.length()
    }

    fn set_length(&mut self, len: u64) -> io::Result<()> {
        self.check_update()?;
        self.inner.set_length(len)
    }
}
