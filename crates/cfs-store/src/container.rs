use std::path::Path;
use std::sync::Arc;

use cfs_types::{is_reserved_name, ContainerPath, ElementReference, StorageError, StorageResult};
use tracing::debug;

use crate::memory::MemoryStorage;
use crate::stream::ContainerStream;
use crate::traits::{AccessMode, ElementInfo, ElementKind, NativeStorage, NativeStream};

/// A compound-file container: a tree of storages and streams under one root.
///
/// The container owns its root native storage. Streams it hands out hold only
/// a weak liveness token, so closing or dropping the container invalidates
/// every open [`ContainerStream`].
pub struct Container {
    root: Box<dyn NativeStorage>,
    liveness: Arc<()>,
}

impl Container {
    /// Wrap an already-open native root storage.
    pub fn new(root: Box<dyn NativeStorage>) -> Self {
        Self {
            root,
            liveness: Arc::new(()),
        }
    }

    /// An unbacked read-write container held entirely in memory.
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStorage::new()))
    }

    /// Create a new container file. Nothing is persisted until [`commit`](Self::commit).
    pub fn create_file(path: &Path) -> StorageResult<Self> {
        debug!(path = %path.display(), "creating container file");
        Ok(Self::new(Box::new(MemoryStorage::create_file(path)?)))
    }

    pub fn open_file(path: &Path, mode: AccessMode) -> StorageResult<Self> {
        debug!(path = %path.display(), %mode, "opening container file");
        Ok(Self::new(Box::new(MemoryStorage::open_file(path, mode)?)))
    }

    pub fn access_mode(&self) -> AccessMode {
        self.root.access_mode()
    }

    /// The root native storage. Reserved elements are reachable through it.
    pub fn root(&self) -> &dyn NativeStorage {
        self.root.as_ref()
    }

    pub fn root_mut(&mut self) -> &mut dyn NativeStorage {
        self.root.as_mut()
    }

    /// Wrap a native stream handle so it shares this container's lifetime.
    pub fn attach(
        &self,
        native: Box<dyn NativeStream>,
        mode: AccessMode,
        name: impl Into<String>,
    ) -> ContainerStream {
        ContainerStream::new(native, mode, Arc::downgrade(&self.liveness), name.into())
    }

    fn check_writable(&self, operation: &str) -> StorageResult<()> {
        if !self.access_mode().can_write() {
            return Err(StorageError::NotSupported(format!(
                "{operation} in a container opened for {}",
                self.access_mode()
            )));
        }
        Ok(())
    }

    /// Run `f` on the storage at `segments`, opened read-only.
    fn with_storage<R>(
        &self,
        segments: &[String],
        f: impl FnOnce(&dyn NativeStorage) -> StorageResult<R>,
    ) -> StorageResult<R> {
        let Some((first, rest)) = segments.split_first() else {
            return f(self.root.as_ref());
        };
        let mode = self.access_mode();
        let mut current = self.root.open_storage(first, mode)?;
        for segment in rest {
            current = current.open_storage(segment, mode)?;
        }
        f(current.as_ref())
    }

    /// Run `f` on the storage at `segments`, creating missing storages when
    /// `create_missing` is set.
    fn with_storage_mut<R>(
        &mut self,
        segments: &[String],
        create_missing: bool,
        f: impl FnOnce(&mut dyn NativeStorage) -> StorageResult<R>,
    ) -> StorageResult<R> {
        let Some((first, rest)) = segments.split_first() else {
            return f(self.root.as_mut());
        };
        let mut current = descend(self.root.as_mut(), first, create_missing)?;
        for segment in rest {
            current = descend(current.as_mut(), segment, create_missing)?;
        }
        f(current.as_mut())
    }

    /// Create a new stream, creating any missing parent storages.
    pub fn create_stream(&mut self, path: &ContainerPath) -> StorageResult<ContainerStream> {
        self.check_writable("create stream")?;
        let (name, parents) = split_leaf(path)?;
        let native = self.with_storage_mut(parents, true, |storage| {
            storage.create_stream(name, AccessMode::ReadWrite)
        })?;
        debug!(path = %path, "stream created");
        Ok(self.attach(native, AccessMode::ReadWrite, path.format()))
    }

    pub fn open_stream(
        &self,
        path: &ContainerPath,
        mode: AccessMode,
    ) -> StorageResult<ContainerStream> {
        let (name, parents) = split_leaf(path)?;
        let native = self.with_storage(parents, |storage| storage.open_stream(name, mode))?;
        Ok(self.attach(native, mode, path.format()))
    }

    /// Create a storage and any missing ancestors.
    pub fn create_storage(&mut self, path: &ContainerPath) -> StorageResult<()> {
        self.check_writable("create storage")?;
        let (name, parents) = split_leaf(path)?;
        self.with_storage_mut(parents, true, |storage| {
            storage.create_storage(name, AccessMode::ReadWrite).map(drop)
        })
    }

    /// List the children of the storage at `path`, hiding reserved elements.
    pub fn list(&self, path: &ContainerPath) -> StorageResult<Vec<ElementInfo>> {
        self.with_storage(path.segments(), |storage| {
            Ok(storage
                .enumerate()?
                .into_iter()
                .filter(|info| !is_reserved_name(&info.name))
                .collect())
        })
    }

    pub fn exists(&self, reference: &ElementReference) -> StorageResult<bool> {
        let path = reference.path();
        let Some((name, parents)) = path.segments().split_last() else {
            return Ok(!reference.is_stream());
        };
        let found = self.with_storage(parents, |storage| storage.element_kind(name));
        let expected = if reference.is_stream() {
            ElementKind::Stream
        } else {
            ElementKind::Storage
        };
        match found {
            Ok(kind) => Ok(kind == Some(expected)),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete the referenced element; storages are removed recursively.
    pub fn delete(&mut self, reference: &ElementReference) -> StorageResult<()> {
        self.check_writable("delete")?;
        if !self.exists(reference)? {
            return Err(StorageError::NotFound(reference.path().format()));
        }
        let (name, parents) = split_leaf(reference.path())?;
        self.with_storage_mut(parents, false, |storage| storage.delete_element(name))?;
        debug!(path = %reference.path(), "element deleted");
        Ok(())
    }

    /// Persist all changes.
    pub fn commit(&mut self) -> StorageResult<()> {
        self.root.commit()
    }

    /// Discard changes since the last commit. Open streams are invalidated.
    pub fn revert(&mut self) -> StorageResult<()> {
        self.root.revert()?;
        self.liveness = Arc::new(());
        Ok(())
    }

    /// Close the container. Every stream opened from it becomes disposed.
    pub fn close(self) {
        debug!(mode = %self.access_mode(), "container closed");
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("mode", &self.access_mode())
            .field("open_streams", &(Arc::weak_count(&self.liveness)))
            .finish()
    }
}

fn split_leaf(path: &ContainerPath) -> StorageResult<(&str, &[String])> {
    match path.segments().split_last() {
        Some((name, parents)) => Ok((name.as_str(), parents)),
        None => Err(StorageError::Argument(
            "the root path does not name an element".into(),
        )),
    }
}

fn descend(
    parent: &mut dyn NativeStorage,
    name: &str,
    create_missing: bool,
) -> StorageResult<Box<dyn NativeStorage>> {
    let mode = parent.access_mode();
    match parent.element_kind(name)? {
        Some(ElementKind::Storage) => parent.open_storage(name, mode),
        Some(ElementKind::Stream) => Err(StorageError::InvalidOperation(format!(
            "{name:?} is a stream and cannot contain elements"
        ))),
        None if create_missing => parent.create_storage(name, mode),
        None => Err(StorageError::NotFound(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    fn path(s: &str) -> ContainerPath {
        ContainerPath::parse(s).unwrap()
    }

    #[test]
    fn create_stream_builds_parents() {
        let mut container = Container::in_memory();
        container
            .create_stream(&path("a\\b\\c"))
            .unwrap()
            .write_all(b"deep")
            .unwrap();
        assert!(container
            .exists(&ElementReference::Storage(path("a\\b")))
            .unwrap());
        let mut stream = container
            .open_stream(&path("A\\B\\C"), AccessMode::Read)
            .unwrap();
        let mut content = String::new();
        stream.read_to_string(&mut content).unwrap();
        assert_eq!(content, "deep");
    }

    #[test]
    fn root_is_not_a_stream() {
        let mut container = Container::in_memory();
        assert!(matches!(
            container.create_stream(&ContainerPath::root()).unwrap_err(),
            StorageError::Argument(_)
        ));
        assert!(container
            .exists(&ElementReference::Storage(ContainerPath::root()))
            .unwrap());
    }

    #[test]
    fn exists_distinguishes_kinds() {
        let mut container = Container::in_memory();
        container.create_stream(&path("s")).unwrap();
        assert!(container.exists(&ElementReference::Stream(path("s"))).unwrap());
        assert!(!container.exists(&ElementReference::Storage(path("s"))).unwrap());
        assert!(!container
            .exists(&ElementReference::Stream(path("missing\\s")))
            .unwrap());
    }

    #[test]
    fn stream_cannot_act_as_storage() {
        let mut container = Container::in_memory();
        container.create_stream(&path("s")).unwrap();
        assert!(matches!(
            container.create_stream(&path("s\\t")).unwrap_err(),
            StorageError::InvalidOperation(_)
        ));
    }

    #[test]
    fn list_hides_reserved_elements() {
        let mut container = Container::in_memory();
        container.create_stream(&path("visible")).unwrap();
        container
            .root_mut()
            .create_storage("\u{6}DataSpaces", AccessMode::ReadWrite)
            .unwrap();
        let names: Vec<String> = container
            .list(&ContainerPath::root())
            .unwrap()
            .into_iter()
            .map(|info| info.name)
            .collect();
        assert_eq!(names, vec!["visible".to_string()]);
    }

    #[test]
    fn delete_removes_subtree() {
        let mut container = Container::in_memory();
        container.create_stream(&path("dir\\one")).unwrap();
        container.create_stream(&path("dir\\two")).unwrap();
        container
            .delete(&ElementReference::Storage(path("dir")))
            .unwrap();
        assert!(container.list(&ContainerPath::root()).unwrap().is_empty());
        assert!(matches!(
            container
                .delete(&ElementReference::Stream(path("dir\\one")))
                .unwrap_err(),
            StorageError::NotFound(_)
        ));
    }

    #[test]
    fn closing_container_disposes_streams() {
        let mut container = Container::in_memory();
        let mut stream = container.create_stream(&path("s")).unwrap();
        container.close();
        assert!(stream.is_disposed());
        assert!(matches!(
            stream.write_region(b"x", 0, 1).unwrap_err(),
            StorageError::Disposed("container")
        ));
    }

    #[test]
    fn read_only_container_rejects_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("ro.cfs");
        let mut container = Container::create_file(&file).unwrap();
        container.create_stream(&path("s")).unwrap();
        container.commit().unwrap();
        container.close();

        let mut ro = Container::open_file(&file, AccessMode::Read).unwrap();
        assert!(matches!(
            ro.create_stream(&path("t")).unwrap_err(),
            StorageError::NotSupported(_)
        ));
        assert!(matches!(
            ro.delete(&ElementReference::Stream(path("s"))).unwrap_err(),
            StorageError::NotSupported(_)
        ));
        let mut stream = ro.open_stream(&path("s"), AccessMode::Read).unwrap();
        assert!(matches!(
            stream.write_region(b"x", 0, 1).unwrap_err(),
            StorageError::NotSupported(_)
        ));
    }

    #[test]
    fn commit_and_reopen_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("c.cfs");
        let mut container = Container::create_file(&file).unwrap();
        container
            .create_stream(&path("docs\\readme"))
            .unwrap()
            .write_all(b"persisted")
            .unwrap();
        container.commit().unwrap();
        drop(container);

        let reopened = Container::open_file(&file, AccessMode::Read).unwrap();
        let mut stream = reopened
            .open_stream(&path("docs\\readme"), AccessMode::Read)
            .unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"persisted");
    }

    #[test]
    fn revert_invalidates_open_streams() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("r.cfs");
        let mut container = Container::create_file(&file).unwrap();
        container.create_stream(&path("kept")).unwrap();
        container.commit().unwrap();
        let stream = container.create_stream(&path("dropped")).unwrap();
        container.revert().unwrap();
        assert!(stream.is_disposed());
        assert!(!container
            .exists(&ElementReference::Stream(path("dropped")))
            .unwrap());
        assert!(container
            .exists(&ElementReference::Stream(path("kept")))
            .unwrap());
    }
}
