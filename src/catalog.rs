//! Backup range catalog.
//!
//! Maps `(owner, range id)` to the live [`BackupRange`]: the secondary log,
//! its staging buffer and the version store. Lookups are read-mostly and
//! share a `RwLock`; insertion and removal serialize on the write half.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;
use crate::ids::RangeKey;
use crate::log::{SecondaryLog, SecondaryLogBuffer};
use crate::version::VersionStore;

/// Everything one backup range owns.
pub struct BackupRange {
    /// Range identity.
    pub key: RangeKey,
    /// Node id non-migrated entries resolve against. Equal to the owner
    /// unless the range took over another range's files after recovery.
    pub original_owner: u16,
    /// The on-disk segmented log.
    pub log: SecondaryLog,
    /// Staging buffer in front of the log.
    pub buffer: SecondaryLogBuffer,
    /// Per-range version control.
    pub versions: VersionStore,
    poisoned: AtomicBool,
}

impl BackupRange {
    /// Create a backup range from its parts.
    pub fn new(
        key: RangeKey,
        log: SecondaryLog,
        buffer: SecondaryLogBuffer,
        versions: VersionStore,
    ) -> Self {
        Self::with_original_owner(key, key.owner, log, buffer, versions)
    }

    /// Create a backup range whose log was inherited from `original_owner`.
    pub fn with_original_owner(
        key: RangeKey,
        original_owner: u16,
        log: SecondaryLog,
        buffer: SecondaryLogBuffer,
        versions: VersionStore,
    ) -> Self {
        Self {
            key,
            original_owner,
            log,
            buffer,
            versions,
            poisoned: AtomicBool::new(false),
        }
    }

    /// Refuse further writes to this range after an append failure.
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    /// Whether writes to this range are refused.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Flush buffer, log and version store.
    pub fn flush(&self, pool: &crate::buffer_pool::BufferPool) -> Result<()> {
        self.buffer.flush(&self.log, pool)?;
        self.log.flush()?;
        self.versions.flush()?;
        Ok(())
    }
}

/// The catalog of all live backup ranges.
#[derive(Default)]
pub struct BackupRangeCatalog {
    ranges: RwLock<HashMap<RangeKey, Arc<BackupRange>>>,
}

impl BackupRangeCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a range.
    pub fn get(&self, key: RangeKey) -> Option<Arc<BackupRange>> {
        self.ranges.read().get(&key).cloned()
    }

    /// Register a range. Returns `false` if the key is already present.
    pub fn insert(&self, range: Arc<BackupRange>) -> bool {
        let mut ranges = self.ranges.write();
        if ranges.contains_key(&range.key) {
            return false;
        }
        ranges.insert(range.key, range);
        true
    }

    /// Remove and return a range.
    pub fn remove(&self, key: RangeKey) -> Option<Arc<BackupRange>> {
        self.ranges.write().remove(&key)
    }

    /// Snapshot of all live ranges.
    pub fn all(&self) -> Vec<Arc<BackupRange>> {
        self.ranges.read().values().cloned().collect()
    }

    /// Number of registered ranges.
    pub fn len(&self) -> usize {
        self.ranges.read().len()
    }

    /// Whether no range is registered.
    pub fn is_empty(&self) -> bool {
        self.ranges.read().is_empty()
    }
}
