//! Per-range segmented secondary log.
//!
//! The log is one preallocated device split into equal segments. Appends go
//! to the writer's active segment; the reorganizer fills its own destination
//! segment, so both may write concurrently without touching the same bytes.
//! Per-segment metadata (fill, entry count, timestamps, reorganization
//! generation) lives in memory only; recovery scans full segments and stops
//! at the zero fill, so stale metadata after a restart is harmless.

use std::io;

use parking_lot::Mutex;

use crate::buffer_pool::PooledBuffer;
use crate::config::CodecConfig;
use crate::device::DiskDevice;
use crate::error::{LogError, Result};
use crate::ids::RangeKey;
use crate::log::write_unaligned;
use crate::utility::align_up;

/// Index of a segment within one secondary log.
pub type SegmentId = usize;

/// Lifecycle state of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SegmentState {
    /// Empty and available for allocation.
    #[default]
    Free,
    /// The writer is currently appending here.
    Active,
    /// Holds data, nobody appends.
    Inactive,
    /// The reorganizer is currently appending kept entries here.
    ReorgDest,
}

/// In-memory metadata of one segment.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentInfo {
    /// Lifecycle state.
    pub state: SegmentState,
    /// Logical bytes written.
    pub used_bytes: u32,
    /// Number of entries.
    pub entries: u32,
    /// Smallest entry timestamp (timestamps enabled only).
    pub oldest_timestamp: u32,
    /// Sum of entry timestamps, for the average age score.
    pub timestamp_sum: u64,
    /// How many times this segment was reorganized.
    pub reorg_generation: u32,
}

impl SegmentInfo {
    fn reset_to_free(&mut self) {
        let generation = self.reorg_generation;
        *self = SegmentInfo {
            reorg_generation: generation + 1,
            ..SegmentInfo::default()
        };
    }
}

/// Which appender a write belongs to; decides the target segment so the
/// writer and the reorganizer never share one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendTarget {
    /// Flush path (drainer / secondary buffer).
    Writer,
    /// Reorganization destination.
    Reorganizer,
}

struct SecondaryLogState {
    segments: Vec<SegmentInfo>,
    active: Option<SegmentId>,
    reorg_dest: Option<SegmentId>,
}

/// One backup range's on-disk log.
pub struct SecondaryLog {
    key: RangeKey,
    device: Box<dyn DiskDevice>,
    codec: CodecConfig,
    segment_size: u64,
    state: Mutex<SecondaryLogState>,
    io_token: Mutex<()>,
}

impl SecondaryLog {
    /// Wrap a preallocated device as a segmented log.
    pub fn new(key: RangeKey, device: Box<dyn DiskDevice>, codec: CodecConfig) -> Self {
        let segment_size = codec.segment_size as u64;
        let segment_count = (device.capacity() / segment_size) as usize;
        Self {
            key,
            device,
            codec,
            segment_size,
            state: Mutex::new(SecondaryLogState {
                segments: vec![SegmentInfo::default(); segment_count],
                active: None,
                reorg_dest: None,
            }),
            io_token: Mutex::new(()),
        }
    }

    /// Range this log belongs to.
    pub fn key(&self) -> RangeKey {
        self.key
    }

    /// Codec parameters of this log's entries.
    pub fn codec(&self) -> &CodecConfig {
        &self.codec
    }

    /// Number of segments.
    pub fn segment_count(&self) -> usize {
        self.state.lock().segments.len()
    }

    /// Exclusive per-log token; the flush path and the reorganizer hold it
    /// across a buffer flush or one segment copy so the two never overlap.
    pub fn io_token(&self) -> &Mutex<()> {
        &self.io_token
    }

    /// Snapshot of one segment's metadata.
    pub fn segment_info(&self, id: SegmentId) -> SegmentInfo {
        self.state.lock().segments[id]
    }

    /// Total logical bytes held across all segments.
    pub fn used_bytes(&self) -> u64 {
        let state = self.state.lock();
        state.segments.iter().map(|s| s.used_bytes as u64).sum()
    }

    /// Fill percentage of the whole log.
    pub fn utilization_percent(&self) -> u64 {
        let capacity = self.segment_size * self.segment_count() as u64;
        self.used_bytes() * 100 / capacity
    }

    /// Number of free segments.
    pub fn free_segments(&self) -> usize {
        let state = self.state.lock();
        state
            .segments
            .iter()
            .filter(|s| s.state == SegmentState::Free)
            .count()
    }

    fn take_segment(
        state: &mut SecondaryLogState,
        target: AppendTarget,
        need: u32,
        segment_size: u64,
        key: RangeKey,
    ) -> Result<SegmentId> {
        let current = match target {
            AppendTarget::Writer => state.active,
            AppendTarget::Reorganizer => state.reorg_dest,
        };

        if let Some(id) = current {
            let remaining = segment_size as u32 - state.segments[id].used_bytes;
            if remaining >= need {
                return Ok(id);
            }
            state.segments[id].state = SegmentState::Inactive;
        }

        let fresh = state
            .segments
            .iter()
            .position(|s| s.state == SegmentState::Free)
            .ok_or_else(|| {
                LogError::Io(io::Error::new(
                    io::ErrorKind::StorageFull,
                    format!("secondary log {key} has no free segment"),
                ))
            })?;

        match target {
            AppendTarget::Writer => {
                state.segments[fresh].state = SegmentState::Active;
                state.active = Some(fresh);
            }
            AppendTarget::Reorganizer => {
                state.segments[fresh].state = SegmentState::ReorgDest;
                state.reorg_dest = Some(fresh);
            }
        }
        Ok(fresh)
    }

    /// Append a blob of whole secondary-format entries.
    ///
    /// `entry_sizes` lists each entry's total size in order; the blob is
    /// split at entry boundaries whenever a segment fills. `timestamps`
    /// matches `entry_sizes` when timestamps are enabled, otherwise it is
    /// empty. The caller holds the log's I/O token.
    pub fn append(
        &self,
        blob: &[u8],
        entry_sizes: &[u32],
        timestamps: &[u32],
        target: AppendTarget,
        scratch: &mut PooledBuffer,
    ) -> Result<()> {
        debug_assert_eq!(
            entry_sizes.iter().map(|s| *s as usize).sum::<usize>(),
            blob.len()
        );

        let mut offset = 0usize;
        let mut entry_idx = 0usize;

        while entry_idx < entry_sizes.len() {
            let (segment, seg_used) = {
                let mut state = self.state.lock();
                let id = Self::take_segment(
                    &mut state,
                    target,
                    entry_sizes[entry_idx],
                    self.segment_size,
                    self.key,
                )?;
                (id, state.segments[id].used_bytes)
            };

            // Greedily pack entries into the remaining segment space.
            let mut piece = 0u32;
            let mut count = 0u32;
            let mut oldest = u32::MAX;
            let mut ts_sum = 0u64;
            while entry_idx < entry_sizes.len()
                && (seg_used + piece + entry_sizes[entry_idx]) as u64 <= self.segment_size
            {
                piece += entry_sizes[entry_idx];
                if let Some(ts) = timestamps.get(entry_idx) {
                    oldest = oldest.min(*ts);
                    ts_sum += *ts as u64;
                }
                count += 1;
                entry_idx += 1;
            }
            debug_assert!(count > 0, "entry larger than a segment");

            let disk_offset = segment as u64 * self.segment_size + seg_used as u64;
            write_unaligned(
                &*self.device,
                disk_offset,
                &blob[offset..offset + piece as usize],
                scratch,
            )?;
            offset += piece as usize;

            let mut state = self.state.lock();
            let info = &mut state.segments[segment];
            info.used_bytes += piece;
            info.entries += count;
            if oldest != u32::MAX {
                info.oldest_timestamp = if info.entries == count {
                    oldest
                } else {
                    info.oldest_timestamp.min(oldest)
                };
                info.timestamp_sum += ts_sum;
            }
        }

        Ok(())
    }

    /// Read the used part of a segment into `buf`. Returns the logical
    /// length. `buf` must be page-aligned and at least a segment large.
    pub fn read_segment(&self, id: SegmentId, buf: &mut [u8]) -> Result<usize> {
        let used = self.state.lock().segments[id].used_bytes as usize;
        if used == 0 {
            return Ok(0);
        }
        let read_len = align_up(used, self.device.alignment().max(1));
        self.device
            .read_at(id as u64 * self.segment_size, &mut buf[..read_len])?;
        Ok(used)
    }

    /// Read a full segment regardless of in-memory metadata (recovery after
    /// restart, where metadata is stale). Returns the segment size.
    pub fn read_segment_raw(&self, id: SegmentId, buf: &mut [u8]) -> Result<usize> {
        let len = self.segment_size as usize;
        self.device.read_at(id as u64 * self.segment_size, &mut buf[..len])?;
        Ok(len)
    }

    /// Pick the segment most worth reorganizing, or `None` if nothing
    /// qualifies. Active and destination segments are never victims.
    ///
    /// Without timestamps the fullest inactive segment wins, preferring the
    /// least recently reorganized on ties. With timestamps the fill is
    /// weighted by the segment's average age, clamped at the cold-data
    /// threshold, so old cold segments are preferred over hot ones.
    pub fn select_victim(
        &self,
        now: u32,
        cold_threshold: u32,
        use_timestamps: bool,
    ) -> Option<SegmentId> {
        let state = self.state.lock();
        state
            .segments
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == SegmentState::Inactive && s.used_bytes > 0)
            .max_by_key(|(_, s)| {
                let score = if use_timestamps && s.entries > 0 {
                    let avg = (s.timestamp_sum / s.entries as u64) as u32;
                    let age = now.saturating_sub(avg).min(cold_threshold) as u64;
                    s.used_bytes as u64 * (1 + age)
                } else {
                    s.used_bytes as u64
                };
                (score, std::cmp::Reverse(s.reorg_generation))
            })
            .map(|(id, _)| id)
    }

    /// Mark a reorganized victim segment free again. The kept entries were
    /// already appended to the destination segment, so the swap is one
    /// metadata update.
    pub fn finish_reorg(&self, victim: SegmentId) -> u64 {
        let mut state = self.state.lock();
        let freed = state.segments[victim].used_bytes as u64;
        state.segments[victim].reset_to_free();
        freed
    }

    /// Close the current reorganization destination (worker leaves this
    /// range); the segment keeps its data and becomes inactive.
    pub fn end_reorg_pass(&self) {
        let mut state = self.state.lock();
        if let Some(id) = state.reorg_dest.take() {
            if state.segments[id].used_bytes > 0 {
                state.segments[id].state = SegmentState::Inactive;
            } else {
                state.segments[id].state = SegmentState::Free;
            }
        }
    }

    /// Flush the underlying device.
    pub fn flush(&self) -> Result<()> {
        self.device.flush()?;
        Ok(())
    }

    /// Flush and close the underlying device. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.device.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::BufferPool;
    use crate::device::BufferedFile;
    use tempfile::tempdir;

    fn test_codec() -> CodecConfig {
        CodecConfig {
            segment_size: 64 * 1024,
            flash_page_size: 4096,
            timestamp_size: 0,
            checksum_size: 0,
        }
    }

    fn test_log() -> (SecondaryLog, BufferPool, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let codec = test_codec();
        let device =
            BufferedFile::open(dir.path().join("0001_0000.sec"), 4 * 64 * 1024).unwrap();
        let pool = BufferPool::new(64 * 1024 + 4096, 4096, 2);
        (
            SecondaryLog::new(RangeKey::new(1, 0), Box::new(device), codec),
            pool,
            dir,
        )
    }

    #[test]
    fn test_append_and_read_back() {
        let (log, pool, _dir) = test_log();
        let mut scratch = pool.acquire().unwrap();

        let blob = vec![0xCD; 300];
        log.append(
            &blob,
            &[100, 100, 100],
            &[],
            AppendTarget::Writer,
            &mut scratch,
        )
        .unwrap();

        let info = log.segment_info(0);
        assert_eq!(info.used_bytes, 300);
        assert_eq!(info.entries, 3);
        assert_eq!(info.state, SegmentState::Active);

        let mut buf = pool.acquire().unwrap();
        let used = log.read_segment(0, buf.as_mut_slice()).unwrap();
        assert_eq!(used, 300);
        assert_eq!(&buf.as_slice()[..300], &blob[..]);
    }

    #[test]
    fn test_segment_switch_at_boundary() {
        let (log, pool, _dir) = test_log();
        let mut scratch = pool.acquire().unwrap();

        // Two entries of 40 KiB cannot share one 64 KiB segment.
        let blob = vec![1u8; 80 * 1024];
        log.append(
            &blob,
            &[40 * 1024, 40 * 1024],
            &[],
            AppendTarget::Writer,
            &mut scratch,
        )
        .unwrap();

        assert_eq!(log.segment_info(0).used_bytes, 40 * 1024);
        assert_eq!(log.segment_info(0).state, SegmentState::Inactive);
        assert_eq!(log.segment_info(1).used_bytes, 40 * 1024);
        assert_eq!(log.segment_info(1).state, SegmentState::Active);
    }

    #[test]
    fn test_writer_and_reorg_segments_disjoint() {
        let (log, pool, _dir) = test_log();
        let mut scratch = pool.acquire().unwrap();

        log.append(&[7u8; 128], &[128], &[], AppendTarget::Writer, &mut scratch)
            .unwrap();
        log.append(
            &[8u8; 128],
            &[128],
            &[],
            AppendTarget::Reorganizer,
            &mut scratch,
        )
        .unwrap();

        assert_eq!(log.segment_info(0).state, SegmentState::Active);
        assert_eq!(log.segment_info(1).state, SegmentState::ReorgDest);
    }

    #[test]
    fn test_victim_selection_prefers_fullest() {
        let (log, pool, _dir) = test_log();
        let mut scratch = pool.acquire().unwrap();

        // Fill two segments, leave a third active.
        log.append(
            &vec![1u8; 60 * 1024],
            &[60 * 1024],
            &[],
            AppendTarget::Writer,
            &mut scratch,
        )
        .unwrap();
        log.append(
            &vec![2u8; 30 * 1024 + 20 * 1024],
            &[30 * 1024, 20 * 1024],
            &[],
            AppendTarget::Writer,
            &mut scratch,
        )
        .unwrap();
        log.append(
            &vec![3u8; 15 * 1024],
            &[15 * 1024],
            &[],
            AppendTarget::Writer,
            &mut scratch,
        )
        .unwrap();

        // Segments 0 (60 KiB) and 1 (50 KiB) are inactive, 2 is active.
        assert_eq!(log.select_victim(0, 9000, false), Some(0));
    }

    #[test]
    fn test_finish_reorg_frees_victim() {
        let (log, pool, _dir) = test_log();
        let mut scratch = pool.acquire().unwrap();

        log.append(
            &vec![1u8; 60 * 1024],
            &[60 * 1024],
            &[],
            AppendTarget::Writer,
            &mut scratch,
        )
        .unwrap();
        log.append(
            &vec![2u8; 5 * 1024],
            &[5 * 1024],
            &[],
            AppendTarget::Writer,
            &mut scratch,
        )
        .unwrap();

        let freed = log.finish_reorg(0);
        assert_eq!(freed, 60 * 1024);

        let info = log.segment_info(0);
        assert_eq!(info.state, SegmentState::Free);
        assert_eq!(info.used_bytes, 0);
        assert_eq!(info.reorg_generation, 1);
    }

    #[test]
    fn test_full_log_reports_storage_full() {
        let (log, pool, _dir) = test_log();
        let mut scratch = pool.acquire().unwrap();

        for byte in 0..4u8 {
            log.append(
                &vec![byte; 60 * 1024],
                &[60 * 1024],
                &[],
                AppendTarget::Writer,
                &mut scratch,
            )
            .unwrap();
        }

        let result = log.append(
            &vec![9u8; 60 * 1024],
            &[60 * 1024],
            &[],
            AppendTarget::Writer,
            &mut scratch,
        );
        assert!(result.is_err());
    }
}
