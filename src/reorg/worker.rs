//! The reorganization worker thread.
//!
//! One long-running thread serves every secondary log. It periodically
//! surveys utilization and queues busy logs at low priority; the drainer
//! preempts the queue through high-priority requests when a log runs out of
//! free segments. Victim segments are copied through pooled buffers: live
//! entries (version matches the version store) move to a destination
//! segment, obsolete ones are dropped, and the victim becomes free space.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;

use crate::buffer_pool::BufferPool;
use crate::catalog::{BackupRange, BackupRangeCatalog};
use crate::config::CodecConfig;
use crate::error::{ErrorKind, Result};
use crate::header::{parse, verify_checksum, Dialect, RingView};
use crate::ids::RangeKey;
use crate::log::{AppendTarget, SegmentId};
use crate::scheduler::ReorgCommand;
use crate::stats::EngineStats;

/// Free segments below which a high-priority pass keeps going.
const FREE_SEGMENT_HIGH_WATER: usize = 2;

/// Tunables for the reorganization worker.
#[derive(Debug, Clone)]
pub struct ReorgConfig {
    /// How often the worker surveys all logs when idle.
    pub survey_interval: Duration,
    /// Utilization percentage that queues a log at low priority.
    pub activate_utilization: u8,
    /// Utilization percentage above which the worker does not yield.
    pub prompt_utilization: u8,
    /// Age clamp for victim scoring (timestamps only).
    pub cold_data_threshold_sec: u32,
    /// Whether entries carry timestamps.
    pub use_timestamps: bool,
}

impl Default for ReorgConfig {
    fn default() -> Self {
        Self {
            survey_interval: Duration::from_millis(500),
            activate_utilization: 60,
            prompt_utilization: 75,
            cold_data_threshold_sec: 9000,
            use_timestamps: false,
        }
    }
}

struct WorkerShared {
    catalog: Arc<BackupRangeCatalog>,
    pool: BufferPool,
    codec: CodecConfig,
    config: ReorgConfig,
    stats: Arc<EngineStats>,
    rx: Receiver<ReorgCommand>,
    running: AtomicBool,
    init_time: Instant,
}

/// Handle to the reorganization thread.
pub struct ReorgWorker {
    shared: Arc<WorkerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReorgWorker {
    /// Spawn the worker.
    pub fn start(
        catalog: Arc<BackupRangeCatalog>,
        pool: BufferPool,
        codec: CodecConfig,
        config: ReorgConfig,
        stats: Arc<EngineStats>,
        rx: Receiver<ReorgCommand>,
        init_time: Instant,
    ) -> Self {
        let shared = Arc::new(WorkerShared {
            catalog,
            pool,
            codec,
            config,
            stats,
            rx,
            running: AtomicBool::new(true),
            init_time,
        });

        let worker = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("oxilog-reorg".into())
            .spawn(move || Self::worker_loop(&worker))
            .expect("spawn reorganization worker");

        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stop the worker and wait for it. Idempotent. Send
    /// [`ReorgCommand::Shutdown`] through the scheduler first for a prompt
    /// exit; otherwise the loop notices within one survey interval.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn worker_loop(shared: &WorkerShared) {
        let mut pending_low: VecDeque<RangeKey> = VecDeque::new();

        while shared.running.load(Ordering::Acquire) {
            let command = if pending_low.is_empty() {
                match shared.rx.recv_timeout(shared.config.survey_interval) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            } else {
                shared.rx.try_recv().ok()
            };

            match command {
                Some(ReorgCommand::Shutdown) => break,
                Some(ReorgCommand::HighPriority(key)) => {
                    Self::compact_range(shared, key, true);
                }
                None => {
                    if let Some(key) = pending_low.pop_front() {
                        if !Self::compact_range(shared, key, false) {
                            // Preempted; finish this range later.
                            pending_low.push_back(key);
                        }
                    } else {
                        Self::survey(shared, &mut pending_low);
                    }
                }
            }
        }
        tracing::debug!("reorganization worker stopped");
    }

    fn survey(shared: &WorkerShared, pending_low: &mut VecDeque<RangeKey>) {
        for range in shared.catalog.all() {
            let utilization = range.log.utilization_percent() as u8;
            if utilization >= shared.config.activate_utilization
                && !pending_low.contains(&range.key)
            {
                tracing::debug!(range = %range.key, utilization, "queueing for reorganization");
                pending_low.push_back(range.key);
            }
        }
    }

    /// Compact segments of one range until its stop condition holds.
    /// Returns `false` when preempted by a pending command.
    fn compact_range(shared: &WorkerShared, key: RangeKey, high_priority: bool) -> bool {
        let Some(range) = shared.catalog.get(key) else {
            return true;
        };

        let mut completed = true;
        loop {
            if !shared.running.load(Ordering::Acquire) {
                break;
            }
            let utilization = range.log.utilization_percent() as u8;
            let done = if high_priority {
                range.log.free_segments() > FREE_SEGMENT_HIGH_WATER
                    && utilization < shared.config.prompt_utilization
            } else {
                utilization < shared.config.activate_utilization
            };
            if done {
                break;
            }

            let now = shared.init_time.elapsed().as_secs() as u32;
            let Some(victim) = range.log.select_victim(
                now,
                shared.config.cold_data_threshold_sec,
                shared.config.use_timestamps,
            ) else {
                break;
            };

            match Self::compact_segment(shared, &range, victim) {
                Ok(reclaimed) => {
                    // A victim with nothing to reclaim means the remaining
                    // candidates are live data; stop instead of shuffling
                    // segments forever.
                    if reclaimed == 0 {
                        break;
                    }
                }
                Err(error) => {
                    tracing::error!(range = %key, victim, %error, "segment reorganization failed");
                    shared.stats.record_error(error.kind());
                    break;
                }
            }

            // Yield at segment boundaries unless the log is critically full.
            if !high_priority
                && utilization < shared.config.prompt_utilization
                && !shared.rx.is_empty()
            {
                completed = false;
                break;
            }
        }

        range.log.end_reorg_pass();
        completed
    }

    /// Copy one victim segment, dropping obsolete and corrupt entries.
    /// Returns the number of bytes reclaimed.
    fn compact_segment(
        shared: &WorkerShared,
        range: &BackupRange,
        victim: SegmentId,
    ) -> Result<u64> {
        let _token = range.log.io_token().lock();

        let mut scratch = shared.pool.acquire()?;
        let mut dest = shared.pool.acquire()?;
        let used = range.log.read_segment(victim, scratch.as_mut_slice())?;

        let mut dest_len = 0usize;
        let mut kept_sizes: Vec<u32> = Vec::new();
        let mut kept_timestamps: Vec<u32> = Vec::new();
        let mut offset = 0usize;

        while offset < used {
            let view = RingView::contiguous(&scratch.as_slice()[..used], offset);
            let info = match parse(Dialect::Secondary, &view, &shared.codec, range.original_owner)
            {
                Ok(Some(info)) => info,
                Ok(None) => break,
                Err(error) => {
                    tracing::warn!(range = %range.key, victim, offset, %error,
                        "unparsable entry during reorganization, dropping segment tail");
                    shared.stats.record_error(ErrorKind::Corrupt);
                    break;
                }
            };

            let size = info.entry_size();
            if offset + size > used {
                tracing::warn!(range = %range.key, victim, offset,
                    "truncated entry during reorganization, dropping segment tail");
                shared.stats.record_error(ErrorKind::Corrupt);
                break;
            }

            if !verify_checksum(&view, &info) {
                tracing::warn!(range = %range.key, victim, cid = %info.cid,
                    "checksum mismatch during reorganization, entry dropped");
                shared.stats.record_error(ErrorKind::ChecksumMismatch);
                offset += size;
                continue;
            }

            // An entry survives iff it still is the chunk's current version;
            // exact equality means live, anything older is reclaimable.
            let current = range.versions.get_current(info.cid);
            if info.version >= current {
                dest.as_mut_slice()[dest_len..dest_len + size]
                    .copy_from_slice(&scratch.as_slice()[offset..offset + size]);
                kept_sizes.push(size as u32);
                if shared.config.use_timestamps {
                    kept_timestamps.push(info.timestamp);
                }
                dest_len += size;
            }
            offset += size;
        }

        if dest_len > 0 {
            range.log.append(
                &dest.as_slice()[..dest_len],
                &kept_sizes,
                &kept_timestamps,
                AppendTarget::Reorganizer,
                &mut scratch,
            )?;
        }

        let freed = range.log.finish_reorg(victim);
        let reclaimed = freed.saturating_sub(dest_len as u64);
        shared.stats.reorg_passes.fetch_add(1, Ordering::Relaxed);
        shared.stats.segments_freed.fetch_add(1, Ordering::Relaxed);
        shared
            .stats
            .bytes_reclaimed
            .fetch_add(reclaimed, Ordering::Relaxed);

        tracing::debug!(range = %range.key, victim, freed,
            kept = dest_len, "segment reorganized");
        Ok(reclaimed)
    }
}
