use std::collections::BTreeMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use cfs_types::{validate_native_name, StorageError, StorageResult};
use tracing::debug;

use crate::snapshot;
use crate::traits::{
    name_key, AccessMode, ElementInfo, ElementKind, ElementStat, NativeStorage, NativeStream,
};

pub(crate) type SharedBytes = Arc<RwLock<Vec<u8>>>;
pub(crate) type SharedNode = Arc<RwLock<StorageNode>>;

#[derive(Clone, Debug)]
pub(crate) enum Element {
    Stream(SharedBytes),
    Storage(SharedNode),
}

#[derive(Debug)]
pub(crate) struct Entry {
    /// Name with original casing; the map key is the folded form.
    pub name: String,
    pub element: Element,
}

#[derive(Debug, Default)]
pub(crate) struct StorageNode {
    pub entries: BTreeMap<String, Entry>,
}

pub(crate) fn read_guard<T>(lock: &RwLock<T>) -> StorageResult<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| StorageError::Io(io::Error::other("storage lock poisoned")))
}

pub(crate) fn write_guard<T>(lock: &RwLock<T>) -> StorageResult<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| StorageError::Io(io::Error::other("storage lock poisoned")))
}

fn to_usize(value: u64) -> StorageResult<usize> {
    usize::try_from(value)
        .map_err(|_| StorageError::Argument(format!("offset {value} exceeds addressable memory")))
}

/// In-memory structured storage.
///
/// Storages and streams live in a shared tree, so every handle opened on the
/// same element observes the same bytes. A root created with
/// [`MemoryStorage::create_file`] or [`MemoryStorage::open_file`] is bound to
/// one physical file: `commit()` on that root writes a checksummed snapshot
/// of the whole tree and `revert()` reloads it. Child handles work in direct
/// mode, where commit and revert are no-ops.
pub struct MemoryStorage {
    node: SharedNode,
    mode: AccessMode,
    backing: Option<PathBuf>,
}

impl MemoryStorage {
    /// Create an empty, unbacked, read-write root storage.
    pub fn new() -> Self {
        Self {
            node: Arc::new(RwLock::new(StorageNode::default())),
            mode: AccessMode::ReadWrite,
            backing: None,
        }
    }

    /// Create a new container file at `path` and bind an empty root to it.
    pub fn create_file(path: &Path) -> StorageResult<Self> {
        if path.exists() {
            return Err(StorageError::AlreadyExists(path.display().to_string()));
        }
        let storage = Self {
            node: Arc::new(RwLock::new(StorageNode::default())),
            mode: AccessMode::ReadWrite,
            backing: Some(path.to_path_buf()),
        };
        snapshot::write_file(path, &*read_guard(&storage.node)?)?;
        Ok(storage)
    }

    /// Load an existing container file.
    pub fn open_file(path: &Path, mode: AccessMode) -> StorageResult<Self> {
        let node = snapshot::read_file(path)?;
        Ok(Self {
            node: Arc::new(RwLock::new(node)),
            mode,
            backing: Some(path.to_path_buf()),
        })
    }

    /// The physical file this root is bound to, if any.
    pub fn backing_path(&self) -> Option<&Path> {
        self.backing.as_deref()
    }

    /// Total bytes across all streams in this subtree.
    pub fn total_bytes(&self) -> StorageResult<u64> {
        fn walk(node: &StorageNode) -> StorageResult<u64> {
            let mut total = 0;
            for entry in node.entries.values() {
                total += match &entry.element {
                    Element::Stream(data) => read_guard(data)?.len() as u64,
                    Element::Storage(child) => walk(&*read_guard(child)?)?,
                };
            }
            Ok(total)
        }
        walk(&*read_guard(&self.node)?)
    }

    fn check_writable(&self, operation: &str) -> StorageResult<()> {
        if !self.mode.can_write() {
            return Err(StorageError::NotSupported(format!(
                "{operation} in a storage opened for {}",
                self.mode
            )));
        }
        Ok(())
    }

    fn check_permits(&self, name: &str, requested: AccessMode) -> StorageResult<()> {
        if !self.mode.permits(requested) {
            return Err(StorageError::NotSupported(format!(
                "cannot open {name:?} for {requested} in a storage opened for {}",
                self.mode
            )));
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> StorageResult<Option<Element>> {
        let node = read_guard(&self.node)?;
        Ok(node.entries.get(&name_key(name)).map(|e| e.element.clone()))
    }

    fn insert(&mut self, name: &str, element: Element) -> StorageResult<()> {
        validate_native_name(name)?;
        let mut node = write_guard(&self.node)?;
        let key = name_key(name);
        if node.entries.contains_key(&key) {
            return Err(StorageError::AlreadyExists(name.to_string()));
        }
        node.entries.insert(
            key,
            Entry {
                name: name.to_string(),
                element,
            },
        );
        Ok(())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeStorage for MemoryStorage {
    fn create_stream(
        &mut self,
        name: &str,
        mode: AccessMode,
    ) -> StorageResult<Box<dyn NativeStream>> {
        self.check_writable("create stream")?;
        let data: SharedBytes = Arc::new(RwLock::new(Vec::new()));
        self.insert(name, Element::Stream(Arc::clone(&data)))?;
        Ok(Box::new(MemoryStream::new(data, mode)))
    }

    fn open_stream(&self, name: &str, mode: AccessMode) -> StorageResult<Box<dyn NativeStream>> {
        self.check_permits(name, mode)?;
        match self.lookup(name)? {
            Some(Element::Stream(data)) => Ok(Box::new(MemoryStream::new(data, mode))),
            Some(Element::Storage(_)) => Err(StorageError::NotFound(format!(
                "{name:?} is a storage, not a stream"
            ))),
            None => Err(StorageError::NotFound(name.to_string())),
        }
    }

    fn create_storage(
        &mut self,
        name: &str,
        mode: AccessMode,
    ) -> StorageResult<Box<dyn NativeStorage>> {
        self.check_writable("create storage")?;
        let node: SharedNode = Arc::new(RwLock::new(StorageNode::default()));
        self.insert(name, Element::Storage(Arc::clone(&node)))?;
        Ok(Box::new(MemoryStorage {
            node,
            mode,
            backing: None,
        }))
    }

    fn open_storage(&self, name: &str, mode: AccessMode) -> StorageResult<Box<dyn NativeStorage>> {
        self.check_permits(name, mode)?;
        match self.lookup(name)? {
            Some(Element::Storage(node)) => Ok(Box::new(MemoryStorage {
                node,
                mode,
                backing: None,
            })),
            Some(Element::Stream(_)) => Err(StorageError::NotFound(format!(
                "{name:?} is a stream, not a storage"
            ))),
            None => Err(StorageError::NotFound(name.to_string())),
        }
    }

    fn enumerate(&self) -> StorageResult<Vec<ElementInfo>> {
        let node = read_guard(&self.node)?;
        let mut infos = Vec::with_capacity(node.entries.len());
        for entry in node.entries.values() {
            let (kind, size) = match &entry.element {
                Element::Stream(data) => (ElementKind::Stream, read_guard(data)?.len() as u64),
                Element::Storage(_) => (ElementKind::Storage, 0),
            };
            infos.push(ElementInfo {
                name: entry.name.clone(),
                kind,
                size,
            });
        }
        Ok(infos)
    }

    fn delete_element(&mut self, name: &str) -> StorageResult<()> {
        self.check_writable("delete element")?;
        let mut node = write_guard(&self.node)?;
        match node.entries.remove(&name_key(name)) {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound(name.to_string())),
        }
    }

    fn commit(&mut self) -> StorageResult<()> {
        if let Some(path) = &self.backing {
            self.check_writable("commit")?;
            snapshot::write_file(path, &*read_guard(&self.node)?)?;
        }
        Ok(())
    }

    fn revert(&mut self) -> StorageResult<()> {
        if let Some(path) = &self.backing {
            let fresh = snapshot::read_file(path)?;
            *write_guard(&self.node)? = fresh;
            debug!(path = %path.display(), "container reverted to last commit");
        }
        Ok(())
    }

    fn stat(&self) -> StorageResult<ElementStat> {
        Ok(ElementStat {
            kind: ElementKind::Storage,
            size: 0,
        })
    }

    fn access_mode(&self) -> AccessMode {
        self.mode
    }

    fn element_kind(&self, name: &str) -> StorageResult<Option<ElementKind>> {
        Ok(self.lookup(name)?.map(|element| match element {
            Element::Stream(_) => ElementKind::Stream,
            Element::Storage(_) => ElementKind::Storage,
        }))
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let children = self.node.read().map(|n| n.entries.len()).unwrap_or(0);
        f.debug_struct("MemoryStorage")
            .field("mode", &self.mode)
            .field("children", &children)
            .field("backing", &self.backing)
            .finish()
    }
}

/// A handle to one in-memory stream. Each handle keeps its own position.
pub struct MemoryStream {
    data: SharedBytes,
    pos: u64,
    mode: AccessMode,
}

impl MemoryStream {
    fn new(data: SharedBytes, mode: AccessMode) -> Self {
        Self { data, pos: 0, mode }
    }
}

impl NativeStream for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        if !self.mode.can_read() {
            return Err(StorageError::NotSupported("stream not opened for reading".into()));
        }
        let data = read_guard(&self.data)?;
        let start = to_usize(self.pos)?;
        if start >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> StorageResult<usize> {
        if !self.mode.can_write() {
            return Err(StorageError::NotSupported("stream not opened for writing".into()));
        }
        let mut data = write_guard(&self.data)?;
        let start = to_usize(self.pos)?;
        let end = start.checked_add(buf.len()).ok_or_else(|| {
            StorageError::Argument(format!("write of {} bytes at offset {start}", buf.len()))
        })?;
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        self.pos = end as u64;
        Ok(buf.len())
    }

    fn seek(&mut self, pos: SeekFrom) -> StorageResult<u64> {
        let len = read_guard(&self.data)?.len() as i128;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => self.pos as i128 + delta as i128,
            SeekFrom::End(delta) => len + delta as i128,
        };
        if target < 0 || target > u64::MAX as i128 {
            return Err(StorageError::Argument(format!("seek to offset {target}")));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }

    fn set_size(&mut self, size: u64) -> StorageResult<()> {
        if !self.mode.can_write() {
            return Err(StorageError::NotSupported("stream not opened for writing".into()));
        }
        write_guard(&self.data)?.resize(to_usize(size)?, 0);
        Ok(())
    }

    fn commit(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn stat(&self) -> StorageResult<ElementStat> {
        Ok(ElementStat {
            kind: ElementKind::Stream,
            size: read_guard(&self.data)?.len() as u64,
        })
    }
}
