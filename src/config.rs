//! Engine configuration.
//!
//! [`StoreConfig`] carries every tunable knob; [`StoreConfig::verify`]
//! enforces the size constraints before any file is created. Config can be
//! loaded from a TOML file and overridden through `OXILOG__field`
//! environment variables.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{LogError, Result};
use crate::utility::is_power_of_two;

/// How secondary and primary log files are accessed on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskAccessMode {
    /// Buffered file access through the page cache.
    #[default]
    Raf,
    /// Direct file access bypassing the kernel buffer (`O_DIRECT`).
    Dir,
    /// Direct access to a raw partition.
    Raw,
}

impl DiskAccessMode {
    /// Parse the config string form (`raf` / `dir` / `raw`).
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "raf" => Ok(DiskAccessMode::Raf),
            "dir" => Ok(DiskAccessMode::Dir),
            "raw" => Ok(DiskAccessMode::Raw),
            other => Err(LogError::InvalidConfig(format!(
                "unknown harddrive access mode: {other}"
            ))),
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Directory all log and version files are created in.
    pub backup_directory: PathBuf,
    /// Node id of this instance (upper half of locally created chunk ids).
    pub node_id: u16,
    /// Disk access mode for all log files.
    pub harddrive_access: DiskAccessMode,
    /// Path of the raw device (used only with [`DiskAccessMode::Raw`]).
    pub raw_device_path: PathBuf,
    /// Whether every log entry carries a CRC-32 over its payload.
    pub use_checksums: bool,
    /// Whether every log entry carries a timestamp (seconds since init).
    pub use_timestamps: bool,
    /// Flash page size of the underlying hardware.
    pub flash_page_size: u64,
    /// Segment size; secondary logs are reorganized and recovered per segment.
    pub log_segment_size: u64,
    /// Size of the circular primary log.
    pub primary_log_size: u64,
    /// Size of every secondary log (twice the backup range size).
    pub secondary_log_size: u64,
    /// Size of the shared write buffer all producers post into.
    pub write_buffer_size: u64,
    /// Bytes buffered in front of each secondary log before flushing.
    pub secondary_log_buffer_size: u64,
    /// Utilization percentage that enters a log into the low-priority
    /// reorganization queue.
    pub utilization_activate_reorganization: u8,
    /// Utilization percentage above which the reorganizer keeps going
    /// without yielding.
    pub utilization_prompt_reorganization: u8,
    /// Entries older than this are clamped in segment age scoring
    /// (timestamps only).
    pub cold_data_threshold_sec: u32,
    /// Number of segment-sized buffers in the shared pool.
    pub buffer_pool_buffers: usize,
    /// Route small batches through the primary log (two-stage logging).
    /// When false every drained batch goes straight to its secondary log.
    pub two_level_logging: bool,
    /// Delete all files in the backup directory when the store opens.
    pub purge_on_start: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backup_directory: PathBuf::from("./log"),
            node_id: 1,
            harddrive_access: DiskAccessMode::Raf,
            raw_device_path: PathBuf::from("/dev/raw/raw1"),
            use_checksums: true,
            use_timestamps: false,
            flash_page_size: 4 * 1024,
            log_segment_size: 8 * 1024 * 1024,
            primary_log_size: 256 * 1024 * 1024,
            secondary_log_size: 512 * 1024 * 1024,
            write_buffer_size: 32 * 1024 * 1024,
            secondary_log_buffer_size: 128 * 1024,
            utilization_activate_reorganization: 60,
            utilization_prompt_reorganization: 75,
            cold_data_threshold_sec: DEFAULT_COLD_DATA_THRESHOLD_SEC,
            buffer_pool_buffers: 8,
            two_level_logging: true,
            purge_on_start: false,
        }
    }
}

/// Default cold-data clamp for segment age scoring.
pub const DEFAULT_COLD_DATA_THRESHOLD_SEC: u32 = 9000;

impl StoreConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| LogError::InvalidConfig(e.to_string()))
    }

    /// Load configuration from the `OXILOG_CONFIG` env var (if set), then
    /// apply `OXILOG__field` overrides.
    pub fn load_from_env() -> Result<Self> {
        let mut config = match env::var("OXILOG_CONFIG").ok() {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        for (key, value) in env::vars() {
            let Some(field) = key.strip_prefix("OXILOG__") else {
                continue;
            };
            let value = value.trim();

            match field.to_ascii_lowercase().as_str() {
                "backup_directory" => self.backup_directory = PathBuf::from(value),
                "node_id" => self.node_id = parse_value(&key, value)?,
                "harddrive_access" => self.harddrive_access = DiskAccessMode::parse(value)?,
                "raw_device_path" => self.raw_device_path = PathBuf::from(value),
                "use_checksums" => self.use_checksums = parse_value(&key, value)?,
                "use_timestamps" => self.use_timestamps = parse_value(&key, value)?,
                "flash_page_size" => self.flash_page_size = parse_value(&key, value)?,
                "log_segment_size" => self.log_segment_size = parse_value(&key, value)?,
                "primary_log_size" => self.primary_log_size = parse_value(&key, value)?,
                "secondary_log_size" => self.secondary_log_size = parse_value(&key, value)?,
                "write_buffer_size" => self.write_buffer_size = parse_value(&key, value)?,
                "secondary_log_buffer_size" => {
                    self.secondary_log_buffer_size = parse_value(&key, value)?
                }
                "utilization_activate_reorganization" => {
                    self.utilization_activate_reorganization = parse_value(&key, value)?
                }
                "utilization_prompt_reorganization" => {
                    self.utilization_prompt_reorganization = parse_value(&key, value)?
                }
                "cold_data_threshold_sec" => {
                    self.cold_data_threshold_sec = parse_value(&key, value)?
                }
                "buffer_pool_buffers" => self.buffer_pool_buffers = parse_value(&key, value)?,
                "two_level_logging" => self.two_level_logging = parse_value(&key, value)?,
                "purge_on_start" => self.purge_on_start = parse_value(&key, value)?,
                other => {
                    return Err(LogError::InvalidConfig(format!(
                        "unknown config key: {other}"
                    )))
                }
            }
        }

        Ok(())
    }

    /// Verify the configuration values. The engine refuses to start on error.
    pub fn verify(&self) -> Result<()> {
        let page = self.flash_page_size;
        if !is_power_of_two(page) {
            return Err(LogError::InvalidConfig(format!(
                "flash page size must be a power of two, got {page}"
            )));
        }

        for (name, size) in [
            ("primary log size", self.primary_log_size),
            ("secondary log size", self.secondary_log_size),
            ("write buffer size", self.write_buffer_size),
            ("log segment size", self.log_segment_size),
            ("secondary log buffer size", self.secondary_log_buffer_size),
        ] {
            if size % page != 0 || size <= page {
                return Err(LogError::InvalidConfig(format!(
                    "{name} must be a multiple of and greater than flash page size \
                     ({size} vs {page})"
                )));
            }
        }

        let segment = self.log_segment_size;
        for (name, size) in [
            ("primary log size", self.primary_log_size),
            ("secondary log size", self.secondary_log_size),
            ("write buffer size", self.write_buffer_size),
        ] {
            if size % segment != 0 || size <= segment {
                return Err(LogError::InvalidConfig(format!(
                    "{name} must be a multiple of and greater than segment size \
                     ({size} vs {segment})"
                )));
            }
        }

        if self.secondary_log_buffer_size > segment {
            return Err(LogError::InvalidConfig(
                "secondary log buffer size must not exceed segment size".into(),
            ));
        }

        // The length field is at most three bytes wide.
        if segment > 16 * 1024 * 1024 {
            return Err(LogError::InvalidConfig(format!(
                "segment size must not exceed 16 MiB, got {segment}"
            )));
        }

        // The drainer holds up to three pool buffers at once.
        if self.buffer_pool_buffers < 4 {
            return Err(LogError::InvalidConfig(
                "buffer pool must hold at least four buffers".into(),
            ));
        }

        if self.utilization_prompt_reorganization <= 50 {
            tracing::warn!(
                threshold = self.utilization_prompt_reorganization,
                "prompt reorganization threshold is <= 50, reorganization will run continuously"
            );
        }

        if !self.use_timestamps && self.cold_data_threshold_sec != DEFAULT_COLD_DATA_THRESHOLD_SEC {
            tracing::warn!("cold data threshold was modified, but timestamps are disabled");
        }

        Ok(())
    }

    /// Number of segments in one secondary log.
    pub fn segments_per_secondary_log(&self) -> usize {
        (self.secondary_log_size / self.log_segment_size) as usize
    }

    /// The immutable codec parameters derived from this configuration.
    pub fn codec(&self) -> CodecConfig {
        CodecConfig {
            segment_size: self.log_segment_size as u32,
            flash_page_size: self.flash_page_size as u32,
            timestamp_size: if self.use_timestamps { 4 } else { 0 },
            checksum_size: if self.use_checksums { 4 } else { 0 },
        }
    }
}

/// Immutable header codec parameters, fixed at engine construction and
/// threaded by value through every component that reads or writes entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecConfig {
    /// Segment size in bytes; chunks larger than half of it are chained.
    pub segment_size: u32,
    /// Flash page size in bytes.
    pub flash_page_size: u32,
    /// Width of the timestamp field (0 or 4).
    pub timestamp_size: u8,
    /// Width of the checksum field (0 or 4).
    pub checksum_size: u8,
}

impl CodecConfig {
    /// Payload threshold above which an entry is split into a chain.
    #[inline]
    pub const fn chaining_threshold(&self) -> u32 {
        self.segment_size / 2
    }

    /// Largest payload a single chain part may carry.
    #[inline]
    pub const fn max_part_payload(&self) -> u32 {
        self.segment_size - crate::header::MAX_HEADER_SIZE as u32
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| LogError::InvalidConfig(format!("invalid value for {key}: {value}")))
}
