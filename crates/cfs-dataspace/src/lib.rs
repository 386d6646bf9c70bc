//! Data spaces for compound-file containers.
//!
//! A data space is a named chain of transforms. Streams stored in a data
//! space hold their encoded form in the container; the manager hands out
//! streams presenting the logical content, running each transform of the
//! chain on the way in and out.
//!
//! # Quick Start
//!
//! ```rust
//! use std::io::{Read, Write};
//!
//! use cfs_dataspace::{DataSpaceManager, TransformKind};
//! use cfs_store::{AccessMode, Container};
//! use cfs_types::ContainerPath;
//!
//! let mut manager = DataSpaceManager::open(Container::in_memory()).unwrap();
//! manager.define_transform("deflate", TransformKind::Compression).unwrap();
//! manager.define_data_space("compressed", ["deflate"]).unwrap();
//!
//! let path = ContainerPath::parse("docs\\notes").unwrap();
//! let mut stream = manager.create_stream(&path, Some("compressed")).unwrap();
//! stream.write_all(b"hello").unwrap();
//! stream.dispose().unwrap();
//!
//! let mut stream = manager.open_stream(&path, AccessMode::Read).unwrap();
//! let mut text = String::new();
//! stream.read_to_string(&mut text).unwrap();
//! assert_eq!(text, "hello");
//! ```
//!
//! # Building Blocks
//!
//! - [`DataSpaceManager`] -- persists data-space definitions and stream mappings
//! - [`DataSpaceTransform`] -- compression or rights-management encryption
//! - [`VersionedStream`] -- gates reads and writes on a stored format version
//! - [`StreamWithDictionary`] -- a stream plus its pipeline context
//! - [`SpillStream`] -- staging buffer that moves to a temporary file when large
//! - [`DataSpaceConfig`] -- block size and spill thresholds, loadable from TOML

pub mod compression;
pub mod config;
pub mod dictionary;
pub mod encryption;
pub mod license;
pub mod manager;
pub mod spill;
pub mod transform;
pub mod versioned;

// Re-exports for convenience.
pub use compression::{CompressingStream, CompressionTransform};
pub use config::DataSpaceConfig;
pub use dictionary::StreamWithDictionary;
pub use encryption::{CryptoProvider, EncryptedStream, RightsManagementEncryptionTransform};
pub use license::{AuthenticationKind, ContentUser, MAX_LICENSE_CHARS, USE_LICENSE_PREFIX};
pub use manager::{DataSpaceManager, DATA_SPACES_STORAGE, DATA_SPACE_KEY, ELEMENT_KEY};
pub use spill::SpillStream;
pub use transform::{DataSpaceTransform, TransformInstance, TransformKind, TransformState};
pub use versioned::{SharedVersionedStream, VersionChecked, VersionedStream};

#[cfg(test)]
mod tests {
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::sync::Arc;

    use cfs_store::{AccessMode, Container};
    use cfs_types::{read_all, ContainerPath, DataStream, ElementReference, StorageError, StorageResult};
    use proptest::prelude::*;
    use rand::{RngCore, SeedableRng};

    use super::*;

    /// Position-dependent XOR, enough to prove bytes are transformed.
    struct Scramble;

    impl CryptoProvider for Scramble {
        fn can_encrypt(&self) -> bool {
            true
        }

        fn can_decrypt(&self) -> bool {
            true
        }

        fn block_size(&self) -> usize {
            32
        }

        fn encrypt(&self, block_index: u64, block: &mut [u8]) -> StorageResult<()> {
            for (i, b) in block.iter_mut().enumerate() {
                *b ^= (block_index as u8).wrapping_mul(31).wrapping_add(i as u8) | 1;
            }
            Ok(())
        }

        fn decrypt(&self, block_index: u64, block: &mut [u8]) -> StorageResult<()> {
            self.encrypt(block_index, block)
        }
    }

    fn path(s: &str) -> ContainerPath {
        ContainerPath::parse(s).unwrap()
    }

    fn payload(len: usize, seed: u64) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::rngs::StdRng::seed_from_u64(seed).fill_bytes(&mut data);
        data
    }

    fn define_all(manager: &mut DataSpaceManager) {
        manager
            .define_transform("deflate", TransformKind::Compression)
            .unwrap();
        manager
            .define_transform("drm", TransformKind::RightsManagementEncryption)
            .unwrap();
        manager.define_data_space("compressed", ["deflate"]).unwrap();
        manager
            .define_data_space("protected", ["drm", "deflate"])
            .unwrap();
        let drm = manager.rights_management_mut("drm").unwrap();
        drm.set_crypto_provider(Arc::new(Scramble)).unwrap();
        drm.save_publish_license("<publish-license/>").unwrap();
    }

    #[test]
    fn file_backed_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("doc.cfs");
        let text = b"the quick brown fox ".repeat(400);
        let binary = payload(50_000, 7);
        let alice = ContentUser::new("alice@example.com", AuthenticationKind::Windows);

        {
            let mut manager = DataSpaceManager::open(Container::create_file(&file).unwrap()).unwrap();
            define_all(&mut manager);

            let mut stream = manager
                .create_stream(&path("content\\text"), Some("compressed"))
                .unwrap();
            stream.write_all(&text).unwrap();
            stream.dispose().unwrap();

            let mut stream = manager
                .create_stream(&path("content\\secret"), Some("protected"))
                .unwrap();
            stream.write_all(&binary).unwrap();
            stream.dispose().unwrap();

            let mut stream = manager.create_stream(&path("plain"), None).unwrap();
            stream.write_all(b"untouched").unwrap();
            stream.dispose().unwrap();

            manager
                .rights_management_mut("drm")
                .unwrap()
                .save_use_license(&alice, "<use-license/>")
                .unwrap();
            manager.commit().unwrap();
        }

        let container = Container::open_file(&file, AccessMode::ReadWrite).unwrap();
        let mut manager = DataSpaceManager::open(container).unwrap();
        assert_eq!(manager.data_space_names(), vec!["compressed", "protected"]);
        assert_eq!(manager.transform_names(), vec!["deflate", "drm"]);
        assert_eq!(
            manager.data_space_transforms("PROTECTED").unwrap(),
            ["drm", "deflate"]
        );
        assert_eq!(
            manager.data_space_of(&ElementReference::Stream(path("content\\secret"))),
            Some("protected")
        );
        assert_eq!(
            manager.data_space_of(&ElementReference::Stream(path("plain"))),
            None
        );

        let mut stream = manager
            .open_stream(&path("content\\text"), AccessMode::Read)
            .unwrap();
        assert_eq!(read_all(&mut stream).unwrap(), text);

        // Encryption needs a provider again in each session.
        let err = manager
            .open_stream(&path("content\\secret"), AccessMode::Read)
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidOperation(_)));

        let drm = manager.rights_management_mut("drm").unwrap();
        assert_eq!(
            drm.load_publish_license().unwrap().as_deref(),
            Some("<publish-license/>")
        );
        assert_eq!(
            drm.load_use_license(&alice).unwrap().as_deref(),
            Some("<use-license/>")
        );
        drm.set_crypto_provider(Arc::new(Scramble)).unwrap();

        let mut stream = manager
            .open_stream(&path("content\\secret"), AccessMode::Read)
            .unwrap();
        assert_eq!(stream.length().unwrap(), binary.len() as u64);
        assert_eq!(read_all(&mut stream).unwrap(), binary);

        let mut stream = manager.open_stream(&path("plain"), AccessMode::Read).unwrap();
        assert_eq!(read_all(&mut stream).unwrap(), b"untouched");
    }

    #[test]
    fn stacked_chain_stores_transformed_bytes() {
        let mut manager = DataSpaceManager::open(Container::in_memory()).unwrap();
        define_all(&mut manager);
        let target = path("stacked");
        let text = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".repeat(100);

        let mut stream = manager.create_stream(&target, Some("protected")).unwrap();
        stream.write_all(&text).unwrap();
        stream.dispose().unwrap();

        let stored = {
            let mut raw = manager
                .container()
                .open_stream(&target, AccessMode::Read)
                .unwrap();
            read_all(&mut raw).unwrap()
        };
        // Plaintext length prefix of the encrypted layer, then ciphertext.
        let compressed_len = i64::from_le_bytes(stored[0..8].try_into().unwrap());
        assert!(compressed_len > 0 && (compressed_len as usize) < text.len());
        assert_ne!(&stored[8..12], &0x0FA0u32.to_le_bytes());

        let mut stream = manager.open_stream(&target, AccessMode::ReadWrite).unwrap();
        stream.seek(SeekFrom::Start(10)).unwrap();
        stream.write_all(b"XYZ").unwrap();
        stream.dispose().unwrap();

        let mut stream = manager.open_stream(&target, AccessMode::Read).unwrap();
        let content = read_all(&mut stream).unwrap();
        assert_eq!(content.len(), text.len());
        assert_eq!(&content[8..15], b"aaXYZaa");
    }

    #[test]
    fn read_only_container_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("ro.cfs");
        {
            let mut manager = DataSpaceManager::open(Container::create_file(&file).unwrap()).unwrap();
            manager
                .define_transform("deflate", TransformKind::Compression)
                .unwrap();
            manager.define_data_space("compressed", ["deflate"]).unwrap();
            let mut stream = manager
                .create_stream(&path("doc"), Some("compressed"))
                .unwrap();
            stream.write_all(b"frozen").unwrap();
            stream.dispose().unwrap();
            manager.commit().unwrap();
        }

        let container = Container::open_file(&file, AccessMode::Read).unwrap();
        let mut manager = DataSpaceManager::open(container).unwrap();
        let mut stream = manager.open_stream(&path("doc"), AccessMode::Read).unwrap();
        let mut text = String::new();
        stream.read_to_string(&mut text).unwrap();
        assert_eq!(text, "frozen");

        let err = stream.write(b"thaw").unwrap_err();
        assert!(matches!(
            StorageError::from_io(err),
            StorageError::NotSupported(_)
        ));
        assert!(matches!(
            manager
                .define_transform("another", TransformKind::Compression)
                .unwrap_err(),
            StorageError::NotSupported(_)
        ));
    }

    #[test]
    fn closing_container_disposes_streams() {
        let mut manager = DataSpaceManager::open(Container::in_memory()).unwrap();
        let mut stream = manager.create_stream(&path("orphan"), None).unwrap();
        manager.into_container().close();
        let err = stream.write(b"late").unwrap_err();
        assert!(matches!(
            StorageError::from_io(err),
            StorageError::Disposed(_)
        ));
    }

    #[test]
    fn small_spill_threshold_still_round_trips() {
        let config = DataSpaceConfig::from_toml(
            "compression_block_size = 512\nspill_high_water = 2048\nspill_low_water = 256\n",
        )
        .unwrap();
        let mut manager = DataSpaceManager::with_config(Container::in_memory(), config).unwrap();
        manager
            .define_transform("deflate", TransformKind::Compression)
            .unwrap();
        manager.define_data_space("compressed", ["deflate"]).unwrap();

        let data = payload(10_000, 42);
        let mut stream = manager
            .create_stream(&path("big"), Some("compressed"))
            .unwrap();
        stream.write_all(&data).unwrap();
        stream.dispose().unwrap();

        let mut stream = manager.open_stream(&path("big"), AccessMode::Read).unwrap();
        assert_eq!(read_all(&mut stream).unwrap(), data);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn protected_streams_round_trip(data in proptest::collection::vec(any::<u8>(), 0..3000)) {
            let mut manager = DataSpaceManager::open(Container::in_memory()).unwrap();
            define_all(&mut manager);
            let target = path("prop");
            let mut stream = manager.create_stream(&target, Some("protected")).unwrap();
            stream.write_all(&data).unwrap();
            stream.dispose().unwrap();

            let mut stream = manager.open_stream(&target, AccessMode::Read).unwrap();
            prop_assert_eq!(read_all(&mut stream).unwrap(), data);
        }
    }
}
