//! Engine configuration.

use std::path::Path;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Buffer for the synchronous copy loop.
pub const OPERATION_BUFFER: usize = 320 * 1024;
/// Synchronous buffer when either side is removable media.
pub const REMOVABLE_DISK_COPY_BUFFER: usize = 64 * 1024;
/// Largest pipelined block.
pub const ASYNC_COPY_BUF_SIZE: usize = 1024 * 1024;
/// Targets at least this long are preallocated.
pub const PREALLOCATE_MIN_SIZE: u64 = 1024 * 1024;
/// Bytes compared between source and target before a pipelined copy resumes.
pub const RETRYCOPY_TAIL_MINSIZE: usize = 32 * 1024;

/// One step of the pipelined buffer-size ladder: files up to `max_file_size`
/// use blocks of `buffer_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferTier {
    pub max_file_size: u64,
    pub buffer_size: usize,
}

/// Default pipelined tiers: 128 KiB, 256 KiB, 512 KiB, then 1 MiB.
pub fn default_async_tiers() -> Vec<BufferTier> {
    vec![
        BufferTier {
            max_file_size: 512 * 1024,
            buffer_size: 128 * 1024,
        },
        BufferTier {
            max_file_size: 2 * 1024 * 1024,
            buffer_size: 256 * 1024,
        },
        BufferTier {
            max_file_size: 8 * 1024 * 1024,
            buffer_size: 512 * 1024,
        },
    ]
}

/// Tunables of the execution engine.
#[derive(Debug, Clone, Builder, Serialize, Deserialize, PartialEq, Eq)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct EngineConfig {
    /// Allow the pipelined strategy at all.
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub use_async_copy: bool,

    /// Buffer for the synchronous loop.
    #[builder(default = "OPERATION_BUFFER")]
    #[serde(default = "default_operation_buffer")]
    pub operation_buffer: usize,

    /// Synchronous buffer when removable media is involved.
    #[builder(default = "REMOVABLE_DISK_COPY_BUFFER")]
    #[serde(default = "default_removable_buffer")]
    pub removable_buffer: usize,

    /// Pipelined tiers in ascending `max_file_size` order.
    #[builder(default = "default_async_tiers()")]
    #[serde(default = "default_async_tiers")]
    pub async_tiers: Vec<BufferTier>,

    /// Pipelined block size for files larger than every tier.
    #[builder(default = "ASYNC_COPY_BUF_SIZE")]
    #[serde(default = "default_async_max")]
    pub async_max_buffer: usize,

    /// Minimum file length worth preallocating.
    #[builder(default = "PREALLOCATE_MIN_SIZE")]
    #[serde(default = "default_preallocate")]
    pub preallocate_min_size: u64,

    /// Bytes compared before resuming a pipelined copy.
    #[builder(default = "RETRYCOPY_TAIL_MINSIZE")]
    #[serde(default = "default_tail")]
    pub tail_verify_size: usize,

    /// Capacity of the event channel towards the UI.
    #[builder(default = "100")]
    #[serde(default = "default_channel")]
    pub event_channel_size: usize,

    /// Minimum interval between progress events.
    #[builder(default = "100")]
    #[serde(default = "default_progress_interval")]
    pub progress_interval_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_operation_buffer() -> usize {
    OPERATION_BUFFER
}

fn default_removable_buffer() -> usize {
    REMOVABLE_DISK_COPY_BUFFER
}

fn default_async_max() -> usize {
    ASYNC_COPY_BUF_SIZE
}

fn default_preallocate() -> u64 {
    PREALLOCATE_MIN_SIZE
}

fn default_tail() -> usize {
    RETRYCOPY_TAIL_MINSIZE
}

fn default_channel() -> usize {
    100
}

fn default_progress_interval() -> u64 {
    100
}

impl EngineConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        let defaults = default_async_tiers();
        validate_parts(
            &[
                ("operation_buffer", self.operation_buffer),
                ("removable_buffer", self.removable_buffer),
                ("async_max_buffer", self.async_max_buffer),
                ("event_channel_size", self.event_channel_size),
            ],
            self.async_tiers.as_deref().unwrap_or(&defaults),
            self.tail_verify_size.unwrap_or(RETRYCOPY_TAIL_MINSIZE),
        )
    }
}

fn validate_parts(
    sizes: &[(&str, Option<usize>)],
    tiers: &[BufferTier],
    tail_verify_size: usize,
) -> Result<(), String> {
    if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == Some(0)) {
        return Err(format!("{name} cannot be zero"));
    }
    if tiers.iter().any(|t| t.buffer_size == 0) {
        return Err("Buffer tiers cannot use zero-sized buffers".to_string());
    }
    if tiers
        .windows(2)
        .any(|w| w[0].max_file_size >= w[1].max_file_size)
    {
        return Err("Buffer tiers must be sorted by file size".to_string());
    }
    if let Some(smallest) = tiers.iter().map(|t| t.buffer_size).min() {
        if tail_verify_size > smallest {
            return Err(format!(
                "tail_verify_size ({tail_verify_size}) exceeds the smallest async buffer ({smallest})"
            ));
        }
    }
    Ok(())
}

impl EngineConfig {
    /// Create a new config builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Load a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path).map_err(|e| EngineError::io(path, e))?;
        Self::from_toml(&text)
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, EngineError> {
        let config: Self = toml::from_str(text).map_err(|e| EngineError::InvalidConfig {
            message: e.to_string(),
        })?;
        config.check()?;
        Ok(config)
    }

    /// Validate a configuration that did not come through the builder.
    pub fn check(&self) -> Result<(), EngineError> {
        validate_parts(
            &[
                ("operation_buffer", Some(self.operation_buffer)),
                ("removable_buffer", Some(self.removable_buffer)),
                ("async_max_buffer", Some(self.async_max_buffer)),
                ("event_channel_size", Some(self.event_channel_size)),
            ],
            &self.async_tiers,
            self.tail_verify_size,
        )
        .map_err(|message| EngineError::InvalidConfig { message })
    }

    /// Pipelined block size for a file of `file_size` bytes.
    pub fn async_buffer_for(&self, file_size: u64) -> usize {
        self.async_tiers
            .iter()
            .find(|t| file_size <= t.max_file_size)
            .map(|t| t.buffer_size)
            .unwrap_or(self.async_max_buffer)
    }

    /// Synchronous buffer size; `removable` selects the small buffer.
    pub fn sync_buffer(&self, removable: bool) -> usize {
        if removable {
            self.removable_buffer
        } else {
            self.operation_buffer
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            use_async_copy: true,
            operation_buffer: OPERATION_BUFFER,
            removable_buffer: REMOVABLE_DISK_COPY_BUFFER,
            async_tiers: default_async_tiers(),
            async_max_buffer: ASYNC_COPY_BUF_SIZE,
            preallocate_min_size: PREALLOCATE_MIN_SIZE,
            tail_verify_size: RETRYCOPY_TAIL_MINSIZE,
            event_channel_size: 100,
            progress_interval_ms: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::builder()
            .use_async_copy(false)
            .operation_buffer(64usize * 1024)
            .build()
            .unwrap();

        assert!(!config.use_async_copy);
        assert_eq!(config.operation_buffer, 64 * 1024);
        assert_eq!(config.tail_verify_size, RETRYCOPY_TAIL_MINSIZE);
    }

    #[test]
    fn test_config_rejects_zero_buffer() {
        let result = EngineConfig::builder().operation_buffer(0usize).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_config_rejects_large_tail() {
        let result = EngineConfig::builder()
            .tail_verify_size(256usize * 1024)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_async_buffer_tiers() {
        let config = EngineConfig::default();
        assert_eq!(config.async_buffer_for(1), 128 * 1024);
        assert_eq!(config.async_buffer_for(512 * 1024), 128 * 1024);
        assert_eq!(config.async_buffer_for(2 * 1024 * 1024), 256 * 1024);
        assert_eq!(config.async_buffer_for(8 * 1024 * 1024), 512 * 1024);
        assert_eq!(config.async_buffer_for(8 * 1024 * 1024 + 1), 1024 * 1024);
    }

    #[test]
    fn test_sync_buffer() {
        let config = EngineConfig::default();
        assert_eq!(config.sync_buffer(false), 320 * 1024);
        assert_eq!(config.sync_buffer(true), 64 * 1024);
    }

    #[test]
    fn test_from_toml() {
        let config =
            EngineConfig::from_toml("use_async_copy = false\ntail_verify_size = 4096\n").unwrap();
        assert!(!config.use_async_copy);
        assert_eq!(config.tail_verify_size, 4096);
        assert_eq!(config.operation_buffer, OPERATION_BUFFER);

        assert!(EngineConfig::from_toml("operation_buffer = 0").is_err());
    }
}
