//! Single-file persistence for the in-memory storage tree.
//!
//! File layout:
//! ```text
//! [4 bytes: magic "CFS1"]
//! [4 bytes: snapshot version (u32 LE)]
//! [N bytes: bincode-serialized element tree]
//! [32 bytes: BLAKE3 hash of the N payload bytes]
//! ```

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, RwLock};

use cfs_types::validate_native_name;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::memory::{read_guard, Element, Entry, StorageNode};
use crate::traits::name_key;

const MAGIC: &[u8; 4] = b"CFS1";
pub(crate) const SNAPSHOT_VERSION: u32 = 1;
const HEADER_SIZE: usize = 8;
const CHECKSUM_SIZE: usize = 32;

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
enum SnapshotElement {
    Stream {
        name: String,
        data: Vec<u8>,
    },
    Storage {
        name: String,
        children: Vec<SnapshotElement>,
    },
}

fn capture(node: &StorageNode) -> StoreResult<Vec<SnapshotElement>> {
    let mut elements = Vec::with_capacity(node.entries.len());
    for entry in node.entries.values() {
        elements.push(match &entry.element {
            Element::Stream(data) => SnapshotElement::Stream {
                name: entry.name.clone(),
                data: read_guard(data)?.clone(),
            },
            Element::Storage(child) => SnapshotElement::Storage {
                name: entry.name.clone(),
                children: capture(&*read_guard(child)?)?,
            },
        });
    }
    Ok(elements)
}

fn restore(elements: Vec<SnapshotElement>) -> StoreResult<StorageNode> {
    let mut entries = BTreeMap::new();
    for element in elements {
        let (name, element) = match element {
            SnapshotElement::Stream { name, data } => {
                (name, Element::Stream(Arc::new(RwLock::new(data))))
            }
            SnapshotElement::Storage { name, children } => {
                let node = restore(children)?;
                (name, Element::Storage(Arc::new(RwLock::new(node))))
            }
        };
        validate_native_name(&name)
            .map_err(|e| StoreError::CorruptPayload(format!("element name: {e}")))?;
        let key = name_key(&name);
        if entries.contains_key(&key) {
            return Err(StoreError::CorruptPayload(format!(
                "duplicate element {name:?}"
            )));
        }
        entries.insert(key, Entry { name, element });
    }
    Ok(StorageNode { entries })
}

pub(crate) fn encode(node: &StorageNode) -> StoreResult<Vec<u8>> {
    let payload = bincode::serialize(&capture(node)?)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len() + CHECKSUM_SIZE);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(blake3::hash(&payload).as_bytes());
    Ok(out)
}

pub(crate) fn decode(bytes: &[u8]) -> StoreResult<StorageNode> {
    if bytes.len() < HEADER_SIZE + CHECKSUM_SIZE {
        return Err(StoreError::Truncated(bytes.len()));
    }
    if &bytes[0..4] != MAGIC {
        return Err(StoreError::InvalidMagic {
            expected: String::from_utf8_lossy(MAGIC).into_owned(),
            actual: String::from_utf8_lossy(&bytes[0..4]).into_owned(),
        });
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != SNAPSHOT_VERSION {
        return Err(StoreError::UnsupportedVersion(version));
    }

    let (payload, checksum) = bytes[HEADER_SIZE..].split_at(bytes.len() - HEADER_SIZE - CHECKSUM_SIZE);
    let computed = blake3::hash(payload);
    if computed.as_bytes() != checksum {
        return Err(StoreError::ChecksumMismatch {
            stored: hex::encode(checksum),
            computed: computed.to_hex().to_string(),
        });
    }

    let elements: Vec<SnapshotElement> = bincode::deserialize(payload)
        .map_err(|e| StoreError::CorruptPayload(e.to_string()))?;
    restore(elements)
}

/// Atomically replace the file at `path` with a snapshot of `node`.
pub(crate) fn write_file(path: &Path, node: &StorageNode) -> StoreResult<()> {
    let bytes = encode(node)?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    debug!(path = %path.display(), bytes = bytes.len(), "container snapshot written");
    Ok(())
}

pub(crate) fn read_file(path: &Path) -> StoreResult<StorageNode> {
    let bytes = std::fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => StoreError::FileNotFound(path.to_path_buf()),
        _ => StoreError::Io(e),
    })?;
    let node = decode(&bytes)?;
    debug!(path = %path.display(), bytes = bytes.len(), "container snapshot loaded");
    Ok(node)
}
