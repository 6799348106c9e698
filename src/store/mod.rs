//! The engine facade.
//!
//! [`LogStore`] wires the components together and exposes the public
//! operations: backup range lifecycle, batched chunk logging, logical
//! deletes, recovery and the utilization report. Construction order keeps
//! references one-directional: the scheduler owns only the channel into the
//! reorganization worker, and the write path reaches the logs through the
//! catalog.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::buffer_pool::BufferPool;
use crate::catalog::{BackupRange, BackupRangeCatalog};
use crate::config::{CodecConfig, DiskAccessMode, StoreConfig};
use crate::device::open_device;
use crate::error::{ErrorKind, LogError, Result};
use crate::ids::{ChunkId, RangeKey};
use crate::log::{PrimaryLog, SecondaryLog, SecondaryLogBuffer};
use crate::recovery::{
    recover_from_file, LogRecoveryHandler, RecoveredChunk, RecoveryMetadata, RecoverySink,
};
use crate::reorg::{ReorgConfig, ReorgWorker};
use crate::scheduler::Scheduler;
use crate::stats::EngineStats;
use crate::version::VersionStore;
use crate::writebuffer::{WriteBuffer, WriteBufferHandler};

/// Grace period for draining in-flight writes during shutdown and range
/// removal.
const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// The two-stage logging engine.
pub struct LogStore {
    config: StoreConfig,
    codec: CodecConfig,
    catalog: Arc<BackupRangeCatalog>,
    pool: BufferPool,
    primary: Arc<PrimaryLog>,
    handler: WriteBufferHandler,
    scheduler: Arc<Scheduler>,
    reorg: ReorgWorker,
    recovery: LogRecoveryHandler,
    stats: Arc<EngineStats>,
    closed: AtomicBool,
}

impl LogStore {
    /// Open the engine: validate the configuration, create the backup
    /// directory and start the drainer and reorganization workers.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.verify()?;

        if config.purge_on_start {
            Self::purge_log_directory(&config.backup_directory)?;
        }
        std::fs::create_dir_all(&config.backup_directory)?;

        let codec = config.codec();
        let page = config.flash_page_size as usize;
        let init_time = Instant::now();

        // Pool buffers hold one segment plus one page so unaligned writes
        // can widen to page boundaries without a second buffer.
        let pool = BufferPool::new(
            (config.log_segment_size + config.flash_page_size) as usize,
            page,
            config.buffer_pool_buffers,
        );

        let primary_device = open_device(
            config.harddrive_access,
            &config.backup_directory.join("primary.log"),
            config.primary_log_size,
            page,
        )?;
        let primary = Arc::new(PrimaryLog::new(primary_device));

        let catalog = Arc::new(BackupRangeCatalog::new());
        let stats = Arc::new(EngineStats::new());
        let ring = Arc::new(WriteBuffer::new(config.write_buffer_size, page));

        let (scheduler, reorg_rx) = Scheduler::channel();
        let scheduler = Arc::new(scheduler);

        let handler = WriteBufferHandler::new(
            Arc::clone(&ring),
            Arc::clone(&catalog),
            Arc::clone(&primary),
            pool.clone(),
            codec,
            Arc::clone(&scheduler),
            Arc::clone(&stats),
            init_time,
            config.use_timestamps,
            config.two_level_logging,
        );

        let reorg = ReorgWorker::start(
            Arc::clone(&catalog),
            pool.clone(),
            codec,
            ReorgConfig {
                survey_interval: Duration::from_millis(500),
                activate_utilization: config.utilization_activate_reorganization,
                prompt_utilization: config.utilization_prompt_reorganization,
                cold_data_threshold_sec: config.cold_data_threshold_sec,
                use_timestamps: config.use_timestamps,
            },
            Arc::clone(&stats),
            reorg_rx,
            init_time,
        );

        let recovery = LogRecoveryHandler::new(Arc::clone(&catalog), pool.clone(), codec);

        tracing::info!(dir = %config.backup_directory.display(), "log store opened");
        Ok(Self {
            config,
            codec,
            catalog,
            pool,
            primary,
            handler,
            scheduler,
            reorg,
            recovery,
            stats,
            closed: AtomicBool::new(false),
        })
    }

    /// Delete all regular files in `path`. Opt-in operator command; never
    /// runs implicitly unless `purge_on_start` is set.
    pub fn purge_log_directory(path: &Path) -> Result<()> {
        let entries = match std::fs::read_dir(path) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(error) => return Err(error.into()),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LogError::Shutdown);
        }
        Ok(())
    }

    fn secondary_log_path(&self, key: RangeKey) -> PathBuf {
        self.config.backup_directory.join(format!("{key}.sec"))
    }

    fn version_log_path(&self, key: RangeKey) -> PathBuf {
        self.config.backup_directory.join(format!("{key}.ver"))
    }

    /// Disk mode for per-range files. The raw partition, when configured,
    /// backs the primary log only; secondary logs fall back to direct files.
    fn secondary_access_mode(&self) -> DiskAccessMode {
        match self.config.harddrive_access {
            DiskAccessMode::Raw => DiskAccessMode::Dir,
            mode => mode,
        }
    }

    /// Register a new backup range. Returns `false` if the range already
    /// exists.
    pub fn init_backup_range(&self, range_id: u16, owner: u16) -> Result<bool> {
        self.ensure_open()?;
        let key = RangeKey::new(owner, range_id);
        self.register_range(key, key.owner)
    }

    fn register_range(&self, key: RangeKey, original_owner: u16) -> Result<bool> {
        if self.catalog.get(key).is_some() {
            return Ok(false);
        }

        let device = open_device(
            self.secondary_access_mode(),
            &self.secondary_log_path(key),
            self.config.secondary_log_size,
            self.config.flash_page_size as usize,
        )?;
        let log = SecondaryLog::new(key, device, self.codec);
        let buffer = SecondaryLogBuffer::new(
            self.config.secondary_log_buffer_size as usize,
            self.config.flash_page_size as usize,
            self.config.use_timestamps,
        );
        let versions = VersionStore::open(self.version_log_path(key))?;

        let inserted = self.catalog.insert(Arc::new(BackupRange::with_original_owner(
            key,
            original_owner,
            log,
            buffer,
            versions,
        )));
        if inserted {
            tracing::info!(range = %key, original_owner, "backup range initialized");
        }
        Ok(inserted)
    }

    /// Register a backup range after recovery: either a brand-new one or a
    /// takeover of the original range's files.
    pub fn init_recovered_backup_range(
        &self,
        range_id: u16,
        owner: u16,
        original_range_id: u16,
        original_owner: u16,
        is_new: bool,
    ) -> Result<bool> {
        self.ensure_open()?;
        if is_new {
            return self.init_backup_range(range_id, owner);
        }

        let key = RangeKey::new(owner, range_id);
        let original = RangeKey::new(original_owner, original_range_id);
        if self.catalog.get(key).is_some() {
            return Ok(false);
        }

        let original_sec = self.secondary_log_path(original);
        if !original_sec.exists() {
            tracing::warn!(range = %original, "original backup range files not found");
            return Ok(false);
        }
        std::fs::rename(original_sec, self.secondary_log_path(key))?;
        let original_ver = self.version_log_path(original);
        if original_ver.exists() {
            std::fs::rename(original_ver, self.version_log_path(key))?;
        }

        // Non-migrated entries in the inherited log still name the original
        // owner implicitly.
        self.register_range(key, original_owner)
    }

    /// Remove a backup range: wait for in-flight writes, then free its
    /// buffers and delete its files. Subsequent `log_chunks` for the range
    /// fail with `RangeNotFound`.
    pub fn remove_backup_range(&self, owner: u16, range_id: u16) -> Result<()> {
        self.ensure_open()?;
        let key = RangeKey::new(owner, range_id);

        // In-flight writes to the range must complete first.
        self.handler.flush_and_wait(DRAIN_GRACE);

        let Some(range) = self.catalog.remove(key) else {
            return Err(LogError::RangeNotFound { owner, range_id });
        };

        range.versions.close()?;
        range.log.close()?;
        std::fs::remove_file(self.secondary_log_path(key))?;
        let ver_path = self.version_log_path(key);
        if ver_path.exists() {
            std::fs::remove_file(ver_path)?;
        }
        tracing::info!(range = %key, "backup range removed");
        Ok(())
    }

    /// Append a batch of chunks to a backup range.
    ///
    /// Wire format, `n_entries` times: `cid: u64 LE | len: u32 LE | payload`.
    /// Blocks while the write buffer is full; returns once every entry is
    /// copied into the buffer.
    pub fn log_chunks(
        &self,
        owner: u16,
        range_id: u16,
        n_entries: u32,
        payload: &[u8],
    ) -> Result<()> {
        self.ensure_open()?;
        self.handler
            .post_data(owner, range_id, n_entries, payload)
            .inspect_err(|error| self.stats.record_error(error.kind()))
    }

    /// Logically delete chunks: their current versions become tombstones,
    /// and reorganization reclaims the entries later.
    pub fn remove_chunks(&self, range_id: u16, owner: u16, cids: &[u64]) -> Result<()> {
        self.ensure_open()?;
        let key = RangeKey::new(owner, range_id);
        let range = self
            .catalog
            .get(key)
            .ok_or(LogError::RangeNotFound { owner, range_id })?;

        let cids: Vec<ChunkId> = cids.iter().map(|&raw| ChunkId::from_raw(raw)).collect();
        range.versions.invalidate(&cids)
    }

    /// Recover every surviving chunk of a backup range into `sink`.
    pub fn recover_backup_range(
        &self,
        owner: u16,
        range_id: u16,
        sink: &dyn RecoverySink,
    ) -> Result<RecoveryMetadata> {
        self.ensure_open()?;
        // Anything still sitting in the write buffer belongs to the result.
        self.handler.flush_and_wait(DRAIN_GRACE);

        let metadata = self
            .recovery
            .recover_backup_range(RangeKey::new(owner, range_id), sink)?;
        self.stats
            .record_errors(ErrorKind::ChecksumMismatch, metadata.checksum_errors);
        self.stats
            .record_errors(ErrorKind::Corrupt, metadata.corrupt_segments);
        Ok(metadata)
    }

    /// Recover chunks from a standalone secondary log file, without a
    /// registered range or version log.
    pub fn recover_backup_range_from_file(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<(RecoveryMetadata, Vec<RecoveredChunk>)> {
        self.ensure_open()?;
        recover_from_file(path, &self.codec)
    }

    /// Human-readable utilization of the primary log and every secondary
    /// log.
    pub fn current_utilization(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(
            out,
            "Primary log: {}% of {} bytes ({} bytes written)",
            self.primary.utilization_percent(),
            self.primary.capacity(),
            self.primary.bytes_written(),
        );
        let _ = writeln!(out, "Secondary logs:");

        let mut ranges = self.catalog.all();
        ranges.sort_by_key(|range| range.key);
        for range in ranges {
            let _ = writeln!(
                out,
                "  {}: {}% used, {} of {} segments free, {} chunks tracked",
                range.key,
                range.log.utilization_percent(),
                range.log.free_segments(),
                range.log.segment_count(),
                range.versions.tracked_chunks(),
            );
        }
        let _ = write!(out, "Errors: {}", self.stats.error_summary());
        out
    }

    /// Engine counters.
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Drain the write buffer and flush every log and version store.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.handler.flush_and_wait(DRAIN_GRACE);
        for range in self.catalog.all() {
            range.flush(&self.pool)?;
        }
        self.primary.flush()?;
        Ok(())
    }

    /// Shut the engine down: stop the workers, drain pending writes, flush
    /// and close every file. Idempotent; the second call performs no I/O.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.scheduler.request_shutdown();
        self.handler.flush_and_wait(DRAIN_GRACE);
        self.handler.close();
        self.reorg.stop();

        for range in self.catalog.all() {
            range.buffer.flush(&range.log, &self.pool)?;
            range.log.flush()?;
            range.log.close()?;
            range.versions.close()?;
        }
        self.primary.flush()?;
        self.primary.close()?;
        self.pool.close();

        tracing::info!("log store closed");
        Ok(())
    }
}

impl Drop for LogStore {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            let _ = self.close();
        }
    }
}
