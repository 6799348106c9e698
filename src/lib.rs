//! oxilog - a two-stage log-structured persistence engine
//!
//! Persistent storage for many small, mutable, identified objects
//! ("chunks"), built as the replication tier of an in-memory key-value
//! store:
//!
//! - **Write buffer**: callers post chunk batches into one shared ring; a
//!   drainer aggregates them per backup range
//! - **Two-stage logging**: small sub-streams go through one circular
//!   primary log for sequential SSD writes, large ones straight to their
//!   per-range secondary log
//! - **Reorganization**: a live compaction worker reclaims space from
//!   obsolete entries while writers keep appending
//! - **Recovery**: parallel segment scans rebuild the surviving chunk set
//!   and stream it back to the caller
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use oxilog::{LogStore, StoreConfig};
//!
//! let store = LogStore::open(StoreConfig::default())?;
//! store.init_backup_range(0, owner)?;
//! store.log_chunks(owner, 0, n, &batch)?;
//! let meta = store.recover_backup_range(owner, 0, &sink)?;
//! store.close()?;
//! ```

#![warn(missing_docs)]

pub mod buffer_pool;
pub mod catalog;
pub mod config;
pub mod device;
pub mod error;
pub mod header;
pub mod ids;
pub mod log;
pub mod recovery;
pub mod reorg;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod version;
pub mod writebuffer;
mod utility;

// Re-exports for convenience
pub use config::{CodecConfig, DiskAccessMode, StoreConfig};
pub use error::{ErrorKind, LogError, Result};
pub use ids::{ChunkId, RangeKey, Version};
pub use recovery::{CollectingSink, RecoveredChunk, RecoveryMetadata, RecoverySink};
pub use store::LogStore;

/// Constants used throughout the library
pub mod constants {
    /// Default flash page size in bytes.
    pub const DEFAULT_FLASH_PAGE_SIZE: u64 = 4 * 1024;

    /// Default segment size in bytes.
    pub const DEFAULT_SEGMENT_SIZE: u64 = 8 * 1024 * 1024;

    /// Default primary log size in bytes.
    pub const DEFAULT_PRIMARY_LOG_SIZE: u64 = 256 * 1024 * 1024;

    /// Default write buffer size in bytes.
    pub const DEFAULT_WRITE_BUFFER_SIZE: u64 = 32 * 1024 * 1024;
}

/// Utility for size literals (e.g. 8 * MIB)
pub mod size {
    /// 1 KiB in bytes
    pub const KIB: u64 = 1024;
    /// 1 MiB in bytes
    pub const MIB: u64 = 1024 * KIB;
    /// 1 GiB in bytes
    pub const GIB: u64 = 1024 * MIB;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::config::StoreConfig;
    pub use crate::error::{LogError, Result};
    pub use crate::ids::{ChunkId, RangeKey, Version};
    pub use crate::recovery::{CollectingSink, RecoveredChunk, RecoverySink};
    pub use crate::store::LogStore;
}
