use std::collections::BTreeMap;
use std::io::{self, Read, Seek, SeekFrom, Write};

use cfs_types::{DataStream, StorageError, StorageResult};
use serde_json::Value;

/// A stream paired with a key/value side channel.
///
/// The transform pipeline uses the map to pass context (data-space name,
/// element path) from one layer to the next. Every stream and map operation
/// fails with [`StorageError::Disposed`] once [`dispose`](Self::dispose) has
/// run.
pub struct StreamWithDictionary {
    stream: Option<Box<dyn DataStream>>,
    entries: BTreeMap<String, Value>,
}

impl StreamWithDictionary {
    pub fn new(stream: Box<dyn DataStream>, entries: BTreeMap<String, Value>) -> Self {
        Self {
            stream: Some(stream),
            entries,
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.stream.is_none()
    }

    fn check_disposed(&self) -> StorageResult<()> {
        if self.is_disposed() {
            return Err(StorageError::Disposed("stream"));
        }
        Ok(())
    }

    fn stream(&mut self) -> StorageResult<&mut Box<dyn DataStream>> {
        self.stream.as_mut().ok_or(StorageError::Disposed("stream"))
    }

    pub fn contains_key(&self, key: &str) -> StorageResult<bool> {
        self.check_disposed()?;
        Ok(self.entries.contains_key(key))
    }

    /// Insert a new entry. Fails with `Argument` if `key` is present.
    pub fn add(&mut self, key: impl Into<String>, value: Value) -> StorageResult<()> {
        self.check_disposed()?;
        let key = key.into();
        if self.entries.contains_key(&key) {
            return Err(StorageError::Argument(format!("duplicate key {key:?}")));
        }
        self.entries.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> StorageResult<Option<&Value>> {
        self.check_disposed()?;
        Ok(self.entries.get(key))
    }

    /// Insert or replace an entry, returning the previous value.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> StorageResult<Option<Value>> {
        self.check_disposed()?;
        Ok(self.entries.insert(key.into(), value))
    }

    pub fn remove(&mut self, key: &str) -> StorageResult<Option<Value>> {
        self.check_disposed()?;
        Ok(self.entries.remove(key))
    }

    pub fn clear(&mut self) -> StorageResult<()> {
        self.check_disposed()?;
        self.entries.clear();
        Ok(())
    }

    pub fn keys(&self) -> StorageResult<Vec<String>> {
        self.check_disposed()?;
        Ok(self.entries.keys().cloned().collect())
    }

    pub fn values(&self) -> StorageResult<Vec<Value>> {
        self.check_disposed()?;
        Ok(self.entries.values().cloned().collect())
    }

    pub fn len(&self) -> StorageResult<usize> {
        self.check_disposed()?;
        Ok(self.entries.len())
    }

    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    /// A copy of the side channel, for handing to the next pipeline layer.
    pub fn context(&self) -> StorageResult<BTreeMap<String, Value>> {
        self.check_disposed()?;
        Ok(self.entries.clone())
    }

    /// Flush and close the wrapped stream. Later calls do nothing.
    pub fn dispose(&mut self) -> StorageResult<()> {
        match self.stream.take() {
            Some(mut stream) => stream.flush().map_err(StorageError::from_io),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for StreamWithDictionary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWithDictionary")
            .field("entries", &self.entries)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Read for StreamWithDictionary {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream()?.read(buf)
    }
}

impl Write for StreamWithDictionary {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream()?.flush()
    }
}

impl Seek for StreamWithDictionary {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.stream()?.seek(pos)
    }
}

impl DataStream for StreamWithDictionary {
    fn can_read(&self) -> bool {
        self.stream.as_ref().is_some_and(|s| s.can_read())
    }

    fn can_write(&self) -> bool {
        self.stream.as_ref().is_some_and(|s| s.can_write())
    }

    fn can_seek(&self) -> bool {
        self.stream.as_ref().is_some_and(|s| s.can_seek())
    }

    fn length(&mut self) -> io::Result<u64> {
        self.stream()?.length()
    }

    fn set_length(&mut self, len: u64) -> io::Result<()> {
        self.stream()?.set_length(len)
    }
}
