//! Rights-management encryption.
//!
//! Encoded layout:
//! ```text
//! [8 bytes: plaintext length (i64 LE)]
//! [ceil(length / block size) ciphertext blocks, each exactly one block]
//! ```
//! Plaintext past the logical length inside the last block is always zero,
//! so extending the stream only appends encrypted zero blocks.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use cfs_store::{AccessMode, ElementKind};
use cfs_types::{read_full, wire, DataStream, StorageError, StorageResult};
use tracing::debug;

use crate::dictionary::StreamWithDictionary;
use crate::license::{
    decode_use_license, encode_use_license, is_use_license_stream, new_use_license_stream_name,
    ContentUser, PublishLicense,
};
use crate::transform::{
    not_ready, read_native, write_native, TransformInstance, TransformKind, TransformState,
};
use crate::versioned::{lock, VersionChecked};

const LENGTH_PREFIX: u64 = 8;

/// Block cipher supplied by the rights-management client.
///
/// Blocks are transformed in place. `block_index` lets a provider derive a
/// per-block IV.
pub trait CryptoProvider: Send + Sync {
    fn can_encrypt(&self) -> bool;

    fn can_decrypt(&self) -> bool;

    /// Cipher block size in bytes; must be non-zero.
    fn block_size(&self) -> usize;

    fn encrypt(&self, block_index: u64, block: &mut [u8]) -> StorageResult<()>;

    fn decrypt(&self, block_index: u64, block: &mut [u8]) -> StorageResult<()>;
}

pub struct RightsManagementEncryptionTransform {
    instance: TransformInstance,
    provider: Option<Arc<dyn CryptoProvider>>,
    state: TransformState,
}

impl RightsManagementEncryptionTransform {
    pub fn new(instance: TransformInstance) -> Self {
        Self {
            instance,
            provider: None,
            state: TransformState::Constructed,
        }
    }

    pub fn instance(&self) -> &TransformInstance {
        &self.instance
    }

    pub fn state(&self) -> TransformState {
        self.state
    }

    fn check_settings_mutable(&self, what: &str) -> StorageResult<()> {
        if self.state == TransformState::StreamIssued {
            return Err(StorageError::InvalidOperation(format!(
                "cannot change the {what} of transform {:?} after a stream was issued",
                self.instance.name()
            )));
        }
        Ok(())
    }

    pub fn crypto_provider(&self) -> Option<&Arc<dyn CryptoProvider>> {
        self.provider.as_ref()
    }

    pub fn set_crypto_provider(&mut self, provider: Arc<dyn CryptoProvider>) -> StorageResult<()> {
        self.check_settings_mutable("crypto provider")?;
        if provider.block_size() == 0 {
            return Err(StorageError::Argument(
                "crypto provider reports a zero block size".into(),
            ));
        }
        self.provider = Some(provider);
        self.state = TransformState::Configured;
        Ok(())
    }

    pub fn produce_transformed_stream(
        &mut self,
        encoded: StreamWithDictionary,
    ) -> StorageResult<Box<dyn DataStream>> {
        let provider = match &self.provider {
            Some(provider) => Arc::clone(provider),
            None => {
                return Err(not_ready(
                    self.instance.name(),
                    TransformKind::RightsManagementEncryption,
                ))
            }
        };
        let stream = EncryptedStream::new(encoded, provider);
        self.state = TransformState::StreamIssued;
        debug!(transform = %self.instance.name(), "encrypted stream issued");
        Ok(Box::new(VersionChecked::new(
            Box::new(stream),
            Arc::clone(self.instance.primary()),
        )))
    }

    /// The publish licence stored in the primary instance data, if any.
    pub fn load_publish_license(&self) -> StorageResult<Option<String>> {
        Ok(self.read_publish_license()?.map(|record| record.license))
    }

    fn read_publish_license(&self) -> StorageResult<Option<PublishLicense>> {
        let mut primary = lock(self.instance.primary())?;
        if primary.is_empty()? {
            return Ok(None);
        }
        primary.check_read()?;
        primary.set_position(0);
        PublishLicense::decode(&mut *primary).map(Some)
    }

    /// Replace the publish licence, keeping any extra header bytes already stored.
    pub fn save_publish_license(&mut self, license: &str) -> StorageResult<()> {
        self.check_settings_mutable("publish licence")?;
        let extra_header = self
            .read_publish_license()?
            .map(|record| record.extra_header)
            .unwrap_or_default();
        let bytes = PublishLicense {
            extra_header,
            license: license.to_string(),
        }
        .encode()?;

        let mut primary = lock(self.instance.primary())?;
        primary.check_update()?;
        primary.set_len(0)?;
        primary.set_position(0);
        primary.write_all(&bytes).map_err(StorageError::from_io)?;
        primary.flush().map_err(StorageError::from_io)?;
        debug!(transform = %self.instance.name(), bytes = bytes.len(), "publish licence saved");
        Ok(())
    }

    /// Names of every use-licence stream, with their stored casing.
    pub fn enum_use_license_streams(&self) -> StorageResult<Vec<String>> {
        Ok(self
            .instance
            .storage()
            .enumerate()?
            .into_iter()
            .filter(|info| info.kind == ElementKind::Stream && is_use_license_stream(&info.name))
            .map(|info| info.name)
            .collect())
    }

    fn read_use_license(&self, stream_name: &str) -> StorageResult<(ContentUser, String)> {
        let mut stream = self
            .instance
            .storage()
            .open_stream(stream_name, AccessMode::Read)?;
        decode_use_license(&read_native(stream.as_mut())?)
    }

    pub fn list_use_licenses(&self) -> StorageResult<Vec<(ContentUser, String)>> {
        self.enum_use_license_streams()?
            .iter()
            .map(|name| self.read_use_license(name))
            .collect()
    }

    pub fn load_use_license(&self, user: &ContentUser) -> StorageResult<Option<String>> {
        for name in self.enum_use_license_streams()? {
            let (owner, license) = self.read_use_license(&name)?;
            if owner.matches(user) {
                return Ok(Some(license));
            }
        }
        Ok(None)
    }

    /// Store `license` for `user`, replacing every licence the user already has.
    pub fn save_use_license(&mut self, user: &ContentUser, license: &str) -> StorageResult<()> {
        let bytes = encode_use_license(user, license)?;
        self.delete_use_license(user)?;
        let name = new_use_license_stream_name();
        let mut stream = self
            .instance
            .storage_mut()
            .create_stream(&name, AccessMode::ReadWrite)?;
        write_native(stream.as_mut(), &bytes)?;
        debug!(transform = %self.instance.name(), stream = %name, %user, "use licence saved");
        Ok(())
    }

    /// Remove every use licence of `user`. Returns how many were removed.
    pub fn delete_use_license(&mut self, user: &ContentUser) -> StorageResult<usize> {
        let mut removed = 0;
        for name in self.enum_use_license_streams()? {
            let (owner, _) = self.read_use_license(&name)?;
            if owner.matches(user) {
                self.instance.storage_mut().delete_element(&name)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// End offset of `count` bytes at `at`; it must fit the i64 length prefix.
fn plain_end(at: u64, count: u64) -> StorageResult<u64> {
    at.checked_add(count)
        .filter(|end| i64::try_from(*end).is_ok())
        .ok_or_else(|| StorageError::Argument(format!("{count} bytes at offset {at} out of range")))
}

/// Plaintext view over a block-encrypted stream. Supports random access.
pub struct EncryptedStream {
    encoded: StreamWithDictionary,
    provider: Arc<dyn CryptoProvider>,
    block_size: u64,
    length: Option<u64>,
    position: u64,
}

impl EncryptedStream {
    pub fn new(encoded: StreamWithDictionary, provider: Arc<dyn CryptoProvider>) -> Self {
        let block_size = provider.block_size().max(1) as u64;
        Self {
            encoded,
            provider,
            block_size,
            length: None,
            position: 0,
        }
    }

    fn block_count(&self, len: u64) -> u64 {
        len.div_ceil(self.block_size)
    }

    fn block_offset(&self, index: u64) -> u64 {
        LENGTH_PREFIX + index * self.block_size
    }

    fn plain_len(&mut self) -> StorageResult<u64> {
        if let Some(len) = self.length {
            return Ok(len);
        }
        let stored = self.encoded.length()?;
        let len = if stored == 0 {
            0
        } else {
            if stored < LENGTH_PREFIX {
                return Err(StorageError::corrupt(format!(
                    "encrypted stream of {stored} bytes has no length prefix"
                )));
            }
            self.encoded.seek(SeekFrom::Start(0))?;
            let raw = wire::read_i64(&mut self.encoded)?;
            let len = u64::try_from(raw).map_err(|_| {
                StorageError::corrupt(format!("negative plaintext length {raw}"))
            })?;
            let needed = self.block_offset(self.block_count(len));
            if stored < needed {
                return Err(StorageError::corrupt(format!(
                    "encrypted stream holds {stored} bytes, length {len} needs {needed}"
                )));
            }
            len
        };
        self.length = Some(len);
        Ok(len)
    }

    fn read_block(&mut self, index: u64) -> StorageResult<Vec<u8>> {
        if !self.provider.can_decrypt() {
            return Err(StorageError::NotSupported(
                "crypto provider cannot decrypt".into(),
            ));
        }
        let mut block = vec![0u8; self.block_size as usize];
        let offset = self.block_offset(index);
        self.encoded.seek(SeekFrom::Start(offset))?;
        let got = read_full(&mut self.encoded, &mut block)?;
        if got != block.len() {
            return Err(StorageError::corrupt(format!(
                "ciphertext block {index} truncated: {got} of {} bytes",
                block.len()
            )));
        }
        self.provider.decrypt(index, &mut block)?;
        Ok(block)
    }

    fn write_block(&mut self, index: u64, mut block: Vec<u8>) -> StorageResult<()> {
        self.provider.encrypt(index, &mut block)?;
        let offset = self.block_offset(index);
        self.encoded.seek(SeekFrom::Start(offset))?;
        self.encoded.write_all(&block)?;
        Ok(())
    }

    fn store_len(&mut self, len: u64) -> StorageResult<()> {
        let raw = i64::try_from(len)
            .map_err(|_| StorageError::Argument(format!("length {len} too large")))?;
        self.encoded.seek(SeekFrom::Start(0))?;
        wire::write_i64(&mut self.encoded, raw)?;
        self.length = Some(len);
        Ok(())
    }

    fn zero_blocks(&mut self, from: u64, to: u64) -> StorageResult<()> {
        for index in from..to {
            self.write_block(index, vec![0u8; self.block_size as usize])?;
        }
        Ok(())
    }

    fn check_writable(&self) -> StorageResult<()> {
        if !self.encoded.can_write() {
            return Err(StorageError::NotSupported(
                "write to an encrypted stream opened read-only".into(),
            ));
        }
        if !self.provider.can_encrypt() {
            return Err(StorageError::NotSupported(
                "crypto provider cannot encrypt".into(),
            ));
        }
        Ok(())
    }

    fn read_plain(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        let len = self.plain_len()?;
        if self.position >= len || buf.is_empty() {
            return Ok(0);
        }
        let count = (len - self.position).min(buf.len() as u64) as usize;
        let mut done = 0;
        while done < count {
            let at = self.position + done as u64;
            let index = at / self.block_size;
            let offset = (at % self.block_size) as usize;
            let block = self.read_block(index)?;
            let take = (block.len() - offset).min(count - done);
            buf[done..done + take].copy_from_slice(&block[offset..offset + take]);
            done += take;
        }
        self.position += count as u64;
        Ok(count)
    }

    fn write_plain(&mut self, buf: &[u8]) -> StorageResult<usize> {
        self.check_writable()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let end = plain_end(self.position, buf.len() as u64)?;
        let len = self.plain_len()?;
        let stored_blocks = self.block_count(len);
        let first = self.position / self.block_size;
        self.zero_blocks(stored_blocks, first)?;

        let block_size = self.block_size as usize;
        let mut done = 0;
        while done < buf.len() {
            let at = self.position + done as u64;
            let index = at / self.block_size;
            let offset = (at % self.block_size) as usize;
            let take = (block_size - offset).min(buf.len() - done);
            let mut block = if index < stored_blocks && take < block_size {
                self.read_block(index)?
            } else {
                vec![0u8; block_size]
            };
            block[offset..offset + take].copy_from_slice(&buf[done..done + take]);
            self.write_block(index, block)?;
            done += take;
        }

        self.position = end;
        if self.position > len {
            self.store_len(self.position)?;
        }
        Ok(buf.len())
    }

    fn resize(&mut self, new_len: u64) -> StorageResult<()> {
        self.check_writable()?;
        plain_end(new_len, 0)?;
        let len = self.plain_len()?;
        if new_len > len {
            let (from, to) = (self.block_count(len), self.block_count(new_len));
            self.zero_blocks(from, to)?;
        } else if new_len < len {
            let stored = self.block_offset(self.block_count(new_len));
            self.encoded.set_length(stored)?;
            let tail = (new_len % self.block_size) as usize;
            if tail != 0 {
                let index = new_len / self.block_size;
                let mut block = self.read_block(index)?;
                block[tail..].fill(0);
                self.write_block(index, block)?;
            }
        } else {
            return Ok(());
        }
        self.store_len(new_len)
    }
}

impl Read for EncryptedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_plain(buf)?)
    }
}

impl Write for EncryptedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.write_plain(buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoded.flush()
    }
}

impl Seek for EncryptedStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => self.plain_len()?.checked_add_signed(delta),
        };
        self.position = target.ok_or_else(|| {
            io::Error::from(StorageError::Argument(format!("seek to {pos:?} out of range")))
        })?;
        Ok(self.position)
    }
}

impl DataStream for EncryptedStream {
    fn can_read(&self) -> bool {
        self.encoded.can_read() && self.provider.can_decrypt()
    }

    fn can_write(&self) -> bool {
        self.encoded.can_write() && self.provider.can_encrypt()
    }

    fn can_seek(&self) -> bool {
        self.encoded.can_seek()
    }

    fn length(&mut self) -> io::Result<u64> {
        Ok(self.plain_len()?)
    }

    fn set_length(&mut self, len: u64) -> io::Result<()> {
        Ok(self.resize(len)?)
    }
}
