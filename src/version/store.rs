//! The per-range version store.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;

use crate::error::Result;
use crate::ids::{ChunkId, Version};
use crate::version::log::VersionLog;

/// Pending records buffered before they are appended to the version log.
const PENDING_FLUSH_THRESHOLD: usize = 4096;

struct VersionState {
    map: HashMap<ChunkId, Version>,
    current_epoch: u16,
    log: VersionLog,
    pending: Vec<(ChunkId, Version)>,
}

impl VersionState {
    fn push_pending(&mut self, cid: ChunkId, version: Version) -> Result<()> {
        self.pending.push((cid, version));
        if self.pending.len() >= PENDING_FLUSH_THRESHOLD {
            self.log.append_batch(&self.pending)?;
            self.pending.clear();
        }
        Ok(())
    }
}

/// Versions of every chunk in one backup range.
///
/// All operations serialize on one lock per range; bulk invalidations take
/// it once.
pub struct VersionStore {
    inner: Mutex<VersionState>,
}

impl VersionStore {
    /// Open the version store backed by the log at `path`, rebuilding the
    /// in-memory table from existing records.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let log = VersionLog::open(path)?;
        let mut map = HashMap::new();
        let mut current_epoch = 0u16;
        for (cid, version) in log.read_all()? {
            current_epoch = current_epoch.max(version.epoch);
            map.insert(cid, version);
        }

        Ok(Self {
            inner: Mutex::new(VersionState {
                map,
                current_epoch,
                log,
                pending: Vec::new(),
            }),
        })
    }

    /// Rebuild just the version table from the log at `path`, without
    /// opening a live store (used by recovery).
    pub fn load_map(path: impl AsRef<Path>) -> Result<HashMap<ChunkId, Version>> {
        let log = VersionLog::open(path)?;
        let mut map = HashMap::new();
        for (cid, version) in log.read_all()? {
            map.insert(cid, version);
        }
        log.close()?;
        Ok(map)
    }

    /// Current version of `cid`, or [`Version::UNKNOWN`] if never seen.
    pub fn get_current(&self, cid: ChunkId) -> Version {
        self.inner
            .lock()
            .map
            .get(&cid)
            .copied()
            .unwrap_or(Version::UNKNOWN)
    }

    /// Assign and record the next version of `cid`.
    ///
    /// The counter is monotonic within an epoch; when it nears saturation
    /// (or the stored version is a tombstone) the epoch is bumped and the
    /// counter restarts at 1.
    pub fn get_next(&self, cid: ChunkId) -> Result<Version> {
        let mut state = self.inner.lock();

        let next = match state.map.get(&cid) {
            None => Version::new(state.current_epoch, 1),
            Some(stored) if stored.version >= Version::TOMBSTONE - 1 => {
                Version::new(stored.epoch.wrapping_add(1), 1)
            }
            Some(stored) => Version::new(stored.epoch, stored.version + 1),
        };

        state.current_epoch = state.current_epoch.max(next.epoch);
        state.map.insert(cid, next);
        state.push_pending(cid, next)?;
        Ok(next)
    }

    /// Mark every chunk in `cids` as deleted.
    pub fn invalidate(&self, cids: &[ChunkId]) -> Result<()> {
        let mut state = self.inner.lock();
        for &cid in cids {
            let epoch = match state.map.get(&cid) {
                Some(stored) => stored.epoch,
                None => state.current_epoch,
            };
            let tombstone = Version::tombstone(epoch);
            state.map.insert(cid, tombstone);
            state.push_pending(cid, tombstone)?;
        }
        Ok(())
    }

    /// Number of chunks tracked (tombstones included).
    pub fn tracked_chunks(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Write pending records and fsync the version log.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.inner.lock();
        if !state.pending.is_empty() {
            let pending = std::mem::take(&mut state.pending);
            state.log.append_batch(&pending)?;
        }
        state.log.flush()?;
        Ok(())
    }

    /// Flush and close the version log.
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.inner.lock().log.close()?;
        Ok(())
    }

    /// Close and delete the backing version log file.
    pub fn delete(self) -> Result<()> {
        let state = self.inner.into_inner();
        state.log.delete()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_unknown_chunk() {
        let dir = tempdir().unwrap();
        let store = VersionStore::open(dir.path().join("a.ver")).unwrap();
        assert_eq!(store.get_current(ChunkId::new(1, 1)), Version::UNKNOWN);
    }

    #[test]
    fn test_versions_strictly_increase() {
        let dir = tempdir().unwrap();
        let store = VersionStore::open(dir.path().join("b.ver")).unwrap();
        let cid = ChunkId::new(1, 42);

        let mut previous = Version::UNKNOWN;
        for _ in 0..100 {
            let next = store.get_next(cid).unwrap();
            assert!(next > previous);
            previous = next;
        }
        assert_eq!(store.get_current(cid), previous);
    }

    #[test]
    fn test_epoch_rollover() {
        let dir = tempdir().unwrap();
        let store = VersionStore::open(dir.path().join("c.ver")).unwrap();
        let cid = ChunkId::new(1, 1);

        // Force the counter to the saturation edge.
        {
            let mut state = store.inner.lock();
            state.map.insert(cid, Version::new(0, Version::TOMBSTONE - 1));
        }

        let rolled = store.get_next(cid).unwrap();
        assert_eq!(rolled, Version::new(1, 1));
        assert!(rolled > Version::new(0, Version::TOMBSTONE - 1) || rolled.epoch > 0);
    }

    #[test]
    fn test_invalidate_then_rewrite() {
        let dir = tempdir().unwrap();
        let store = VersionStore::open(dir.path().join("d.ver")).unwrap();
        let cid = ChunkId::new(1, 7);

        let v1 = store.get_next(cid).unwrap();
        store.invalidate(&[cid]).unwrap();
        let tombstone = store.get_current(cid);
        assert!(tombstone.is_tombstone());
        assert!(tombstone > v1);

        // A later write must supersede the tombstone.
        let v2 = store.get_next(cid).unwrap();
        assert!(v2 > tombstone);
        assert_eq!(v2, Version::new(tombstone.epoch + 1, 1));
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("e.ver");
        let cid = ChunkId::new(2, 9);

        {
            let store = VersionStore::open(&path).unwrap();
            store.get_next(cid).unwrap();
            store.get_next(cid).unwrap();
            store.close().unwrap();
        }

        let store = VersionStore::open(&path).unwrap();
        assert_eq!(store.get_current(cid), Version::new(0, 2));

        let map = VersionStore::load_map(&path).unwrap();
        assert_eq!(map.get(&cid), Some(&Version::new(0, 2)));
    }
}
