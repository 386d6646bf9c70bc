use cfs_codec::{DEFAULT_BLOCK_SIZE, MAX_CONFIGURED_BLOCK_SIZE};
use cfs_types::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};

/// Tuning knobs for data-space streams.
///
/// Typically embedded in an application's TOML configuration:
/// ```toml
/// compression_block_size = 4096
/// spill_high_water = 10485760
/// spill_low_water = 102400
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSpaceConfig {
    /// Plaintext bytes per compressed block.
    pub compression_block_size: usize,
    /// Staged plaintext above this size moves from memory to a temporary file.
    pub spill_high_water: u64,
    /// Staged plaintext at or below this size always lives in memory.
    pub spill_low_water: u64,
}

impl Default for DataSpaceConfig {
    fn default() -> Self {
        Self {
            compression_block_size: DEFAULT_BLOCK_SIZE,
            spill_high_water: 10 * 1024 * 1024,
            spill_low_water: 100 * 1024,
        }
    }
}

impl DataSpaceConfig {
    /// Parse and validate a configuration from TOML content.
    pub fn from_toml(content: &str) -> StorageResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| StorageError::Argument(format!("data-space config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> StorageResult<String> {
        toml::to_string(self)
            .map_err(|e| StorageError::Argument(format!("data-space config: {e}")))
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.compression_block_size == 0
            || self.compression_block_size > MAX_CONFIGURED_BLOCK_SIZE
        {
            return Err(StorageError::Argument(format!(
                "compression_block_size {} outside 1..={MAX_CONFIGURED_BLOCK_SIZE}",
                self.compression_block_size
            )));
        }
        if self.spill_low_water > self.spill_high_water {
            return Err(StorageError::Argument(format!(
                "spill_low_water {} exceeds spill_high_water {}",
                self.spill_low_water, self.spill_high_water
            )));
        }
        Ok(())
    }
}
