//! Data-space bookkeeping inside a container.
//!
//! Layout of the reserved storage:
//! ```text
//! "\u{6}DataSpaces"
//!   Version             version record, feature Microsoft.Container.DataSpaces
//!   DataSpaceMap        [i32 header length = 8][i32 entry count][extra header]
//!                       entries: [i32 entry length, counts itself]
//!                                [element reference][UTF-16 data-space name]
//!   DataSpaceInfo\<ds>  [i32 header length = 8][i32 transform count][extra header]
//!                       [UTF-16 transform names, innermost first]
//!   TransformInfo\<t>   see `transform`
//! ```

use std::collections::BTreeMap;
use std::io::{Cursor, Write};

use cfs_store::{name_key, AccessMode, Container, ContainerStream, ElementKind, NativeStorage};
use cfs_types::{
    validate_element_name, wire, ContainerPath, ElementReference, FormatVersion, StorageError,
    StorageResult, VersionPair,
};
use serde_json::Value;
use tracing::debug;

use crate::config::DataSpaceConfig;
use crate::dictionary::StreamWithDictionary;
use crate::encryption::RightsManagementEncryptionTransform;
use crate::transform::{
    not_ready, read_native, write_native, DataSpaceTransform, TransformDefinition,
    TransformInstance, TransformKind, DEFINITION_STREAM, PRIMARY_STREAM,
};
use crate::versioned::{SharedVersionedStream, VersionedStream};

/// Reserved root storage holding all data-space bookkeeping.
pub const DATA_SPACES_STORAGE: &str = "\u{6}DataSpaces";

const VERSION_STREAM: &str = "Version";
const MAP_STREAM: &str = "DataSpaceMap";
const INFO_STORAGE: &str = "DataSpaceInfo";
const TRANSFORM_STORAGE: &str = "TransformInfo";
const RECORD_HEADER_LEN: i32 = 8;

/// Dictionary key carrying the data-space name of a transformed stream.
pub const DATA_SPACE_KEY: &str = "dataSpace";

/// Dictionary key carrying the element path of a stream.
pub const ELEMENT_KEY: &str = "element";

pub const DATA_SPACES_FEATURE: &str = "Microsoft.Container.DataSpaces";

fn data_spaces_version() -> FormatVersion {
    FormatVersion::uniform(DATA_SPACES_FEATURE, VersionPair::new(1, 0))
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct MapEntry {
    reference: ElementReference,
    data_space: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct DataSpaceDefinition {
    name: String,
    transforms: Vec<String>,
}

/// Maps container streams to data spaces and data spaces to transform chains.
///
/// Streams created in a data space store their encoded form; reading and
/// writing them through the manager runs every transform of the chain,
/// innermost (closest to storage) first.
pub struct DataSpaceManager {
    container: Container,
    config: DataSpaceConfig,
    version: Option<VersionedStream>,
    map: Vec<MapEntry>,
    data_spaces: BTreeMap<String, DataSpaceDefinition>,
    transforms: BTreeMap<String, DataSpaceTransform>,
}

impl DataSpaceManager {
    /// Load the data-space bookkeeping of `container`, if it has any.
    pub fn open(container: Container) -> StorageResult<Self> {
        Self::with_config(container, DataSpaceConfig::default())
    }

    pub fn with_config(container: Container, config: DataSpaceConfig) -> StorageResult<Self> {
        config.validate()?;
        let mut manager = Self {
            container,
            config,
            version: None,
            map: Vec::new(),
            data_spaces: BTreeMap::new(),
            transforms: BTreeMap::new(),
        };
        if manager.container.root().element_kind(DATA_SPACES_STORAGE)? == Some(ElementKind::Storage)
        {
            manager.load()?;
        }
        Ok(manager)
    }

    pub fn config(&self) -> &DataSpaceConfig {
        &self.config
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    /// Release the container. Streams opened through the manager stay valid.
    pub fn into_container(self) -> Container {
        self.container
    }

    pub fn commit(&mut self) -> StorageResult<()> {
        self.container.commit()
    }

    fn mode(&self) -> AccessMode {
        self.container.access_mode()
    }

    fn reserved(&self) -> StorageResult<Box<dyn NativeStorage>> {
        self.container
            .root()
            .open_storage(DATA_SPACES_STORAGE, self.mode())
    }

    fn reserved_child(&self, name: &str) -> StorageResult<Box<dyn NativeStorage>> {
        required(self.reserved()?.open_storage(name, self.mode()), name)
    }

    fn attach_primary(
        &self,
        storage: &mut dyn NativeStorage,
        create: bool,
        kind: TransformKind,
        name: &str,
    ) -> StorageResult<SharedVersionedStream> {
        let (native, mode) = if create {
            let native = storage.create_stream(PRIMARY_STREAM, AccessMode::ReadWrite)?;
            (native, AccessMode::ReadWrite)
        } else {
            let native = required(storage.open_stream(PRIMARY_STREAM, self.mode()), PRIMARY_STREAM)?;
            (native, self.mode())
        };
        let stream = self
            .container
            .attach(native, mode, format!("{TRANSFORM_STORAGE}\\{name}\\Primary"));
        Ok(VersionedStream::new(Box::new(stream), kind.code_version()).into_shared())
    }

    fn load(&mut self) -> StorageResult<()> {
        let mode = self.mode();
        let reserved = self.reserved()?;

        let native = required(reserved.open_stream(VERSION_STREAM, mode), VERSION_STREAM)?;
        let mut version = VersionedStream::new(
            Box::new(self.container.attach(native, mode, VERSION_STREAM)),
            data_spaces_version(),
        );
        if version.file_version()?.is_none() {
            return Err(StorageError::corrupt("empty data-space version stream"));
        }
        version.check_read()?;

        let map = decode_map(&read_stream(reserved.as_ref(), MAP_STREAM)?)?;

        let info = self.reserved_child(INFO_STORAGE)?;
        let mut data_spaces = BTreeMap::new();
        for element in info.enumerate()? {
            if element.kind != ElementKind::Stream {
                continue;
            }
            let transforms = decode_info(&read_stream(info.as_ref(), &element.name)?)?;
            data_spaces.insert(
                name_key(&element.name),
                DataSpaceDefinition {
                    name: element.name,
                    transforms,
                },
            );
        }

        let transform_root = self.reserved_child(TRANSFORM_STORAGE)?;
        let mut transforms = BTreeMap::new();
        for element in transform_root.enumerate()? {
            if element.kind != ElementKind::Storage {
                continue;
            }
            let mut storage = transform_root.open_storage(&element.name, mode)?;
            let definition =
                TransformDefinition::decode(&read_stream(storage.as_ref(), DEFINITION_STREAM)?)?;
            if name_key(&definition.name) != name_key(&element.name) {
                return Err(StorageError::corrupt(format!(
                    "transform storage {:?} defines transform {:?}",
                    element.name, definition.name
                )));
            }
            let primary =
                self.attach_primary(storage.as_mut(), false, definition.kind, &element.name)?;
            let instance = TransformInstance::new(element.name.clone(), storage, primary);
            transforms.insert(
                name_key(&element.name),
                DataSpaceTransform::new(definition.kind, instance),
            );
        }

        for definition in data_spaces.values() {
            if let Some(missing) = definition
                .transforms
                .iter()
                .find(|t| !transforms.contains_key(&name_key(t)))
            {
                return Err(StorageError::corrupt(format!(
                    "data space {:?} uses undefined transform {missing:?}",
                    definition.name
                )));
            }
        }
        if let Some(entry) = map
            .iter()
            .find(|entry| !data_spaces.contains_key(&name_key(&entry.data_space)))
        {
            return Err(StorageError::corrupt(format!(
                "{} is mapped to undefined data space {:?}",
                entry.reference.path(),
                entry.data_space
            )));
        }

        debug!(
            data_spaces = data_spaces.len(),
            transforms = transforms.len(),
            mapped = map.len(),
            "data spaces loaded"
        );
        self.version = Some(version);
        self.map = map;
        self.data_spaces = data_spaces;
        self.transforms = transforms;
        Ok(())
    }

    /// Create the reserved storage on first use, or check that the existing
    /// bookkeeping may be updated by this code.
    fn ensure_layout(&mut self) -> StorageResult<()> {
        if let Some(version) = &mut self.version {
            return version.check_update();
        }
        if !self.mode().can_write() {
            return Err(StorageError::NotSupported(format!(
                "define data spaces in a container opened for {}",
                self.mode()
            )));
        }
        let mut reserved = self
            .container
            .root_mut()
            .create_storage(DATA_SPACES_STORAGE, AccessMode::ReadWrite)?;
        reserved.create_storage(INFO_STORAGE, AccessMode::ReadWrite)?;
        reserved.create_storage(TRANSFORM_STORAGE, AccessMode::ReadWrite)?;
        replace_stream(reserved.as_mut(), MAP_STREAM, &encode_map(&[])?)?;
        let native = reserved.create_stream(VERSION_STREAM, AccessMode::ReadWrite)?;
        let mut version = VersionedStream::new(
            Box::new(
                self.container
                    .attach(native, AccessMode::ReadWrite, VERSION_STREAM),
            ),
            data_spaces_version(),
        );
        version.check_update()?;
        self.version = Some(version);
        debug!("data-space storage created");
        Ok(())
    }

    fn write_map(&mut self) -> StorageResult<()> {
        let mut reserved = self.reserved()?;
        replace_stream(reserved.as_mut(), MAP_STREAM, &encode_map(&self.map)?)
    }

    /// Define a transform; `name` becomes its storage name.
    pub fn define_transform(&mut self, name: &str, kind: TransformKind) -> StorageResult<()> {
        validate_element_name(name)?;
        let key = name_key(name);
        if self.transforms.contains_key(&key) {
            return Err(StorageError::AlreadyExists(format!("transform {name:?}")));
        }
        self.ensure_layout()?;

        let mut transform_root = self.reserved_child(TRANSFORM_STORAGE)?;
        let mut storage = transform_root.create_storage(name, AccessMode::ReadWrite)?;
        let definition = TransformDefinition {
            kind,
            name: name.to_string(),
        };
        replace_stream(storage.as_mut(), DEFINITION_STREAM, &definition.encode()?)?;
        let primary = self.attach_primary(storage.as_mut(), true, kind, name)?;
        self.transforms.insert(
            key,
            DataSpaceTransform::new(kind, TransformInstance::new(name, storage, primary)),
        );
        debug!(transform = name, %kind, "transform defined");
        Ok(())
    }

    /// Define a data space as a non-empty chain of existing transforms,
    /// innermost first.
    pub fn define_data_space<I, S>(&mut self, name: &str, transforms: I) -> StorageResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        validate_element_name(name)?;
        let key = name_key(name);
        if self.data_spaces.contains_key(&key) {
            return Err(StorageError::AlreadyExists(format!("data space {name:?}")));
        }
        let mut chain: Vec<String> = Vec::new();
        for transform in transforms {
            let transform = transform.as_ref();
            let defined = self
                .transforms
                .get(&name_key(transform))
                .ok_or_else(|| StorageError::NotFound(format!("transform {transform:?}")))?;
            if chain.iter().any(|t| name_key(t) == name_key(transform)) {
                return Err(StorageError::Argument(format!(
                    "transform {transform:?} appears twice in data space {name:?}"
                )));
            }
            chain.push(defined.name().to_string());
        }
        if chain.is_empty() {
            return Err(StorageError::Argument(format!(
                "data space {name:?} needs at least one transform"
            )));
        }
        self.ensure_layout()?;

        let mut info = self.reserved_child(INFO_STORAGE)?;
        replace_stream(info.as_mut(), name, &encode_info(&chain)?)?;
        debug!(data_space = name, transforms = ?chain, "data space defined");
        self.data_spaces.insert(
            key,
            DataSpaceDefinition {
                name: name.to_string(),
                transforms: chain,
            },
        );
        Ok(())
    }

    /// The data space `reference` is stored in, if any.
    pub fn data_space_of(&self, reference: &ElementReference) -> Option<&str> {
        self.map
            .iter()
            .find(|entry| same_element(&entry.reference, reference))
            .map(|entry| entry.data_space.as_str())
    }

    /// Transform names of a data space, innermost first.
    pub fn data_space_transforms(&self, name: &str) -> Option<&[String]> {
        self.data_spaces
            .get(&name_key(name))
            .map(|definition| definition.transforms.as_slice())
    }

    pub fn transform_names(&self) -> Vec<String> {
        self.transforms.values().map(|t| t.name().to_string()).collect()
    }

    pub fn data_space_names(&self) -> Vec<String> {
        self.data_spaces.values().map(|d| d.name.clone()).collect()
    }

    pub fn transform(&self, name: &str) -> Option<&DataSpaceTransform> {
        self.transforms.get(&name_key(name))
    }

    pub fn transform_mut(&mut self, name: &str) -> Option<&mut DataSpaceTransform> {
        self.transforms.get_mut(&name_key(name))
    }

    /// The rights-management transform called `name`.
    pub fn rights_management_mut(
        &mut self,
        name: &str,
    ) -> StorageResult<&mut RightsManagementEncryptionTransform> {
        let transform = self
            .transforms
            .get_mut(&name_key(name))
            .ok_or_else(|| StorageError::NotFound(format!("transform {name:?}")))?;
        let kind = transform.kind();
        transform.as_rights_management_mut().ok_or_else(|| {
            StorageError::InvalidOperation(format!(
                "transform {name:?} is a {kind} transform, not rights management"
            ))
        })
    }

    fn definition(&self, data_space: &str) -> StorageResult<DataSpaceDefinition> {
        self.data_spaces
            .get(&name_key(data_space))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("data space {data_space:?}")))
    }

    fn check_ready(&self, definition: &DataSpaceDefinition) -> StorageResult<()> {
        for name in &definition.transforms {
            let transform = self.transforms.get(&name_key(name)).ok_or_else(|| {
                StorageError::corrupt(format!("undefined transform {name:?}"))
            })?;
            if !transform.is_ready() {
                return Err(not_ready(transform.name(), transform.kind()));
            }
        }
        Ok(())
    }

    fn build_chain(
        &mut self,
        raw: ContainerStream,
        path: &ContainerPath,
        definition: Option<&DataSpaceDefinition>,
    ) -> StorageResult<StreamWithDictionary> {
        let mut context = BTreeMap::new();
        context.insert(ELEMENT_KEY.to_string(), Value::String(path.format()));
        let Some(definition) = definition else {
            return Ok(StreamWithDictionary::new(Box::new(raw), context));
        };
        context.insert(
            DATA_SPACE_KEY.to_string(),
            Value::String(definition.name.clone()),
        );

        let mut current = StreamWithDictionary::new(Box::new(raw), context.clone());
        for name in &definition.transforms {
            let transform = self.transforms.get_mut(&name_key(name)).ok_or_else(|| {
                StorageError::corrupt(format!("undefined transform {name:?}"))
            })?;
            let logical = transform.produce_transformed_stream(current, &self.config)?;
            current = StreamWithDictionary::new(logical, context.clone());
        }
        Ok(current)
    }

    /// Create a stream, optionally stored in `data_space`.
    pub fn create_stream(
        &mut self,
        path: &ContainerPath,
        data_space: Option<&str>,
    ) -> StorageResult<StreamWithDictionary> {
        let definition = data_space.map(|ds| self.definition(ds)).transpose()?;
        if let Some(definition) = &definition {
            self.check_ready(definition)?;
            self.ensure_layout()?;
        }
        let raw = self.container.create_stream(path)?;
        if let Some(definition) = &definition {
            let reference = ElementReference::Stream(path.clone());
            self.map
                .retain(|entry| !same_element(&entry.reference, &reference));
            self.map.push(MapEntry {
                reference,
                data_space: definition.name.clone(),
            });
            self.write_map()?;
            debug!(path = %path, data_space = %definition.name, "transformed stream created");
        }
        self.build_chain(raw, path, definition.as_ref())
    }

    /// Open a stream. Streams outside any data space come back untransformed.
    ///
    /// Transformed streams need read access to their stored form, so the
    /// underlying stream is opened read-write whenever `mode` allows writing.
    pub fn open_stream(
        &mut self,
        path: &ContainerPath,
        mode: AccessMode,
    ) -> StorageResult<StreamWithDictionary> {
        let reference = ElementReference::Stream(path.clone());
        let definition = self
            .data_space_of(&reference)
            .map(str::to_string)
            .map(|ds| self.definition(&ds))
            .transpose()?;
        let raw = match &definition {
            Some(definition) => {
                self.check_ready(definition)?;
                let raw_mode = if mode.can_write() {
                    AccessMode::ReadWrite
                } else {
                    AccessMode::Read
                };
                self.container.open_stream(path, raw_mode)?
            }
            None => self.container.open_stream(path, mode)?,
        };
        self.build_chain(raw, path, definition.as_ref())
    }

    /// Delete a stream and its data-space mapping.
    pub fn delete_stream(&mut self, path: &ContainerPath) -> StorageResult<()> {
        let reference = ElementReference::Stream(path.clone());
        self.container.delete(&reference)?;
        let before = self.map.len();
        self.map
            .retain(|entry| !same_element(&entry.reference, &reference));
        if self.map.len() != before {
            self.ensure_layout()?;
            self.write_map()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DataSpaceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSpaceManager")
            .field("container", &self.container)
            .field("data_spaces", &self.data_space_names())
            .field("transforms", &self.transform_names())
            .field("mapped", &self.map.len())
            .finish()
    }
}

/// Names compare case-insensitively, as the container does.
fn same_element(a: &ElementReference, b: &ElementReference) -> bool {
    let (pa, pb) = (a.path().segments(), b.path().segments());
    a.is_stream() == b.is_stream()
        && pa.len() == pb.len()
        && pa.iter().zip(pb).all(|(x, y)| name_key(x) == name_key(y))
}

/// Turn a missing bookkeeping element into corruption.
fn required<T>(result: StorageResult<T>, what: &str) -> StorageResult<T> {
    match result {
        Err(StorageError::NotFound(_)) => Err(StorageError::corrupt(format!(
            "data-space element {what:?} is missing"
        ))),
        other => other,
    }
}

fn read_stream(storage: &dyn NativeStorage, name: &str) -> StorageResult<Vec<u8>> {
    let mut stream = required(storage.open_stream(name, AccessMode::Read), name)?;
    read_native(stream.as_mut())
}

fn replace_stream(storage: &mut dyn NativeStorage, name: &str, bytes: &[u8]) -> StorageResult<()> {
    if storage.element_kind(name)?.is_some() {
        storage.delete_element(name)?;
    }
    let mut stream = storage.create_stream(name, AccessMode::ReadWrite)?;
    write_native(stream.as_mut(), bytes)
}

fn to_i32(value: usize, what: &str) -> StorageResult<i32> {
    i32::try_from(value).map_err(|_| StorageError::Argument(format!("{what} {value} too large")))
}

/// Read `[i32 header length][i32 count]` and skip any extra header bytes.
fn read_record_header(reader: &mut Cursor<&[u8]>, what: &str) -> StorageResult<usize> {
    let header_len = wire::read_length(reader, "header length")?;
    if header_len < RECORD_HEADER_LEN as usize {
        return Err(StorageError::corrupt(format!(
            "{what} header length {header_len} below {RECORD_HEADER_LEN}"
        )));
    }
    let count = wire::read_length(reader, "entry count")?;
    wire::skip_bytes(reader, header_len - RECORD_HEADER_LEN as usize, what)?;
    Ok(count)
}

fn encode_map(entries: &[MapEntry]) -> StorageResult<Vec<u8>> {
    let mut out = Vec::new();
    wire::write_i32(&mut out, RECORD_HEADER_LEN)?;
    wire::write_i32(&mut out, to_i32(entries.len(), "map entry count")?)?;
    for entry in entries {
        let entry_len = 4
            + entry.reference.encoded_len()?
            + wire::utf16_string_size(&entry.data_space);
        wire::write_i32(&mut out, to_i32(entry_len, "map entry length")?)?;
        entry.reference.save(Some(&mut out as &mut dyn Write))?;
        wire::write_utf16_string(&mut out, &entry.data_space)?;
    }
    Ok(out)
}

fn decode_map(bytes: &[u8]) -> StorageResult<Vec<MapEntry>> {
    let mut reader = Cursor::new(bytes);
    let count = read_record_header(&mut reader, "data-space map")?;
    let mut entries = Vec::new();
    for _ in 0..count {
        let entry_len = wire::read_length(&mut reader, "map entry length")?;
        let (reference, reference_len) = ElementReference::load(&mut reader)?;
        let (data_space, name_len) = wire::read_utf16_string(&mut reader)?;
        let consumed = 4 + reference_len + name_len;
        if consumed > entry_len {
            return Err(StorageError::corrupt(format!(
                "map entry of {consumed} bytes exceeds its declared length {entry_len}"
            )));
        }
        wire::skip_bytes(&mut reader, entry_len - consumed, "map entry")?;
        entries.push(MapEntry {
            reference,
            data_space,
        });
    }
    Ok(entries)
}

fn encode_info(transforms: &[String]) -> StorageResult<Vec<u8>> {
    let mut out = Vec::new();
    wire::write_i32(&mut out, RECORD_HEADER_LEN)?;
    wire::write_i32(&mut out, to_i32(transforms.len(), "transform count")?)?;
    for transform in transforms {
        wire::write_utf16_string(&mut out, transform)?;
    }
    Ok(out)
}

fn decode_info(bytes: &[u8]) -> StorageResult<Vec<String>> {
    let mut reader = Cursor::new(bytes);
    let count = read_record_header(&mut reader, "data-space definition")?;
    if count == 0 {
        return Err(StorageError::corrupt("data space without transforms"));
    }
    (0..count)
        .map(|_| wire::read_utf16_string(&mut reader).map(|(name, _)| name))
        .collect()
}
