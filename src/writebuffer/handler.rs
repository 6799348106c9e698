//! Ingestion front end and the drainer worker.
//!
//! `post_data` serializes caller batches into the shared ring; the drainer
//! partitions published entries per range and routes each sub-stream either
//! through the circular primary log (small batches, two-stage logging) or
//! straight to the range's secondary log (large batches), converting headers
//! in place on the way.
//!
//! Caller batch wire format, `n` times: `cid: u64 LE | len: u32 LE | payload`.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::buffer_pool::BufferPool;
use crate::catalog::{BackupRange, BackupRangeCatalog};
use crate::config::CodecConfig;
use crate::error::{LogError, Result};
use crate::header::{
    convert_to_secondary, converted_size, parse, payload_crc, serialize_primary, ChainInfo,
    Dialect, EntrySpec, RingView,
};
use crate::ids::{ChunkId, RangeKey};
use crate::log::{AppendTarget, PrimaryLog};
use crate::scheduler::Scheduler;
use crate::stats::EngineStats;
use crate::writebuffer::ring::{BatchDescriptor, WriteBuffer};

/// Remaining free segments at which the drainer raises a high-priority
/// reorganization request for a log.
const FREE_SEGMENT_HIGH_WATER: usize = 2;

/// How long the drainer sleeps when idle.
const DRAIN_IDLE_TIMEOUT: Duration = Duration::from_millis(50);

struct HandlerShared {
    ring: Arc<WriteBuffer>,
    catalog: Arc<BackupRangeCatalog>,
    primary: Arc<PrimaryLog>,
    pool: BufferPool,
    codec: CodecConfig,
    scheduler: Arc<Scheduler>,
    stats: Arc<EngineStats>,
    init_time: Instant,
    use_timestamps: bool,
    two_level_logging: bool,
    stop: AtomicBool,
}

/// Accepts caller batches and owns the drainer thread.
pub struct WriteBufferHandler {
    shared: Arc<HandlerShared>,
    drainer: Mutex<Option<JoinHandle<()>>>,
}

impl WriteBufferHandler {
    /// Create the handler and start its drainer.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ring: Arc<WriteBuffer>,
        catalog: Arc<BackupRangeCatalog>,
        primary: Arc<PrimaryLog>,
        pool: BufferPool,
        codec: CodecConfig,
        scheduler: Arc<Scheduler>,
        stats: Arc<EngineStats>,
        init_time: Instant,
        use_timestamps: bool,
        two_level_logging: bool,
    ) -> Self {
        let shared = Arc::new(HandlerShared {
            ring,
            catalog,
            primary,
            pool,
            codec,
            scheduler,
            stats,
            init_time,
            use_timestamps,
            two_level_logging,
            stop: AtomicBool::new(false),
        });

        let worker = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("oxilog-drainer".into())
            .spawn(move || Self::drain_loop(&worker))
            .expect("spawn drainer");

        Self {
            shared,
            drainer: Mutex::new(Some(handle)),
        }
    }

    fn timestamp_now(shared: &HandlerShared) -> u32 {
        shared.init_time.elapsed().as_secs() as u32
    }

    /// Copy a caller batch into the ring. Returns once every entry is
    /// copied and published; blocks while the ring is full.
    pub fn post_data(
        &self,
        owner: u16,
        range_id: u16,
        n_entries: u32,
        payload: &[u8],
    ) -> Result<()> {
        let shared = &self.shared;
        if shared.stop.load(Ordering::Acquire) {
            return Err(LogError::Shutdown);
        }

        let key = RangeKey::new(owner, range_id);
        let range = shared
            .catalog
            .get(key)
            .ok_or(LogError::RangeNotFound { owner, range_id })?;
        if range.is_poisoned() {
            return Err(LogError::Io(io::Error::other(
                "range refuses writes after an append failure; re-init the range",
            )));
        }

        let timestamp = if shared.use_timestamps {
            Self::timestamp_now(shared)
        } else {
            0
        };

        let mut cursor = 0usize;
        for _ in 0..n_entries {
            if cursor + 12 > payload.len() {
                return Err(LogError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "batch shorter than its declared entry count",
                )));
            }
            let cid = ChunkId::from_raw(u64::from_le_bytes(
                payload[cursor..cursor + 8].try_into().unwrap(),
            ));
            let len =
                u32::from_le_bytes(payload[cursor + 8..cursor + 12].try_into().unwrap()) as usize;
            cursor += 12;
            if cursor + len > payload.len() {
                return Err(LogError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "entry length exceeds batch payload",
                )));
            }
            let chunk = &payload[cursor..cursor + len];
            cursor += len;

            self.post_chunk(&range, key, cid, chunk, timestamp)?;

            shared.stats.chunks_logged.fetch_add(1, Ordering::Relaxed);
            shared
                .stats
                .bytes_logged
                .fetch_add(len as u64, Ordering::Relaxed);
        }

        Ok(())
    }

    /// Serialize one chunk (splitting into a chain when oversized) into the
    /// ring.
    fn post_chunk(
        &self,
        range: &BackupRange,
        key: RangeKey,
        cid: ChunkId,
        chunk: &[u8],
        timestamp: u32,
    ) -> Result<()> {
        let shared = &self.shared;
        let codec = &shared.codec;
        let version = range.versions.get_next(cid)?;

        let threshold = codec.chaining_threshold() as usize;
        let part_cap = codec.max_part_payload() as usize;

        // Non-migrated entries leave their node id implicit; it must match
        // the owner the range's parsers assume.
        let implied_owner = range.original_owner;

        if chunk.len() <= threshold {
            return self.post_part(key, implied_owner, cid, chunk, version, timestamp, None);
        }

        let count = chunk.len().div_ceil(part_cap);
        if count > u8::MAX as usize {
            return Err(LogError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("chunk of {} bytes exceeds the maximum chain length", chunk.len()),
            )));
        }

        for (index, part) in chunk.chunks(part_cap).enumerate() {
            let chain = ChainInfo {
                index: index as u8,
                count: count as u8,
            };
            self.post_part(key, implied_owner, cid, part, version, timestamp, Some(chain))?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn post_part(
        &self,
        key: RangeKey,
        implied_owner: u16,
        cid: ChunkId,
        part: &[u8],
        version: crate::ids::Version,
        timestamp: u32,
        chain: Option<ChainInfo>,
    ) -> Result<()> {
        let shared = &self.shared;
        let checksum = if shared.codec.checksum_size == 4 {
            Some(payload_crc(part))
        } else {
            None
        };

        let spec = EntrySpec {
            cid,
            range_id: key.range_id,
            range_owner: implied_owner,
            payload_len: part.len() as u32,
            version,
            timestamp,
            chain,
            checksum,
        };
        let header = serialize_primary(&spec, &shared.codec);
        let total = header.len() + part.len();

        let pos = shared.ring.reserve(total as u64)?;
        shared.ring.write(pos, header.as_slice());
        shared.ring.write(pos + header.len() as u64, part);
        shared.ring.publish(BatchDescriptor {
            key,
            start: pos,
            len: total as u32,
        });
        Ok(())
    }

    /// Wake the drainer and wait for the ring to empty.
    pub fn flush_and_wait(&self, timeout: Duration) -> bool {
        self.shared.ring.signal_drain();
        self.shared.ring.wait_until_empty(timeout)
    }

    /// Stop the drainer: remaining published work is drained, then the
    /// thread exits. Idempotent.
    pub fn close(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.ring.close();
        if let Some(handle) = self.drainer.lock().take() {
            let _ = handle.join();
        }
    }

    fn drain_loop(shared: &HandlerShared) {
        loop {
            shared.ring.wait_for_work(DRAIN_IDLE_TIMEOUT);
            Self::drain_once(shared);
            if shared.stop.load(Ordering::Acquire) && shared.ring.is_empty() {
                break;
            }
        }
        tracing::debug!("drainer stopped");
    }

    fn drain_once(shared: &HandlerShared) {
        let batches = shared.ring.pop_batches();
        if batches.is_empty() {
            return;
        }

        // Partition into per-range sub-streams, preserving arrival order.
        let mut groups: Vec<(RangeKey, Vec<BatchDescriptor>)> = Vec::new();
        let mut index: HashMap<RangeKey, usize> = HashMap::new();
        for descriptor in batches {
            match index.get(&descriptor.key) {
                Some(&at) => groups[at].1.push(descriptor),
                None => {
                    index.insert(descriptor.key, groups.len());
                    groups.push((descriptor.key, vec![descriptor]));
                }
            }
        }

        for (key, descriptors) in groups {
            if let Some(range) = shared.catalog.get(key) {
                if let Err(error) = Self::route_group(shared, &range, &descriptors) {
                    tracing::error!(range = %key, %error, "drain failed, poisoning range");
                    shared.stats.record_error(error.kind());
                    range.poison();
                } else if range.log.free_segments() <= FREE_SEGMENT_HIGH_WATER {
                    shared.scheduler.request_high_priority(key);
                }
            }
            for descriptor in &descriptors {
                shared.ring.mark_consumed(descriptor.start, descriptor.len);
            }
        }
    }

    fn route_group(
        shared: &HandlerShared,
        range: &BackupRange,
        descriptors: &[BatchDescriptor],
    ) -> Result<()> {
        let total: u64 = descriptors.iter().map(|d| d.len as u64).sum();
        let half_segment = (shared.codec.segment_size / 2) as u64;

        let direct = !shared.two_level_logging
            || total >= half_segment
            || range.buffer.would_overflow(total as usize);

        if direct {
            // Older staged entries must reach the log first.
            range.buffer.flush(&range.log, &shared.pool)?;
            shared.stats.direct_flushes.fetch_add(1, Ordering::Relaxed);
            Self::append_direct(shared, range, descriptors)
        } else {
            Self::append_via_primary(shared, range, descriptors)
        }
    }

    fn entry_view<'a>(shared: &'a HandlerShared, descriptor: &BatchDescriptor) -> RingView<'a> {
        let offset = (descriptor.start % shared.ring.capacity()) as usize;
        RingView::wrapping(shared.ring.data(), offset)
    }

    /// Convert a sub-stream in place and append it to the secondary log,
    /// bypassing the primary log.
    fn append_direct(
        shared: &HandlerShared,
        range: &BackupRange,
        descriptors: &[BatchDescriptor],
    ) -> Result<()> {
        let mut out = shared.pool.acquire()?;
        let out_cap = out.len();
        let mut out_len = 0usize;
        let mut sizes: Vec<u32> = Vec::with_capacity(descriptors.len());
        let mut timestamps: Vec<u32> = Vec::new();

        for descriptor in descriptors {
            let view = Self::entry_view(shared, descriptor);
            let info = parse(Dialect::Primary, &view, &shared.codec, 0)?
                .ok_or_else(|| LogError::Corrupt("empty entry in write buffer".into()))?;
            let entry_size = descriptor.len as usize;
            let conv_size = converted_size(info.type_byte, entry_size);

            if out_len + conv_size > out_cap {
                Self::append_blob(shared, range, &out.as_slice()[..out_len], &sizes, &timestamps)?;
                out_len = 0;
                sizes.clear();
                timestamps.clear();
            }

            convert_to_secondary(&view, entry_size, &mut out.as_mut_slice()[out_len..]);
            out_len += conv_size;
            sizes.push(conv_size as u32);
            if shared.use_timestamps {
                timestamps.push(info.timestamp);
            }
        }

        if out_len > 0 {
            Self::append_blob(shared, range, &out.as_slice()[..out_len], &sizes, &timestamps)?;
        }
        Ok(())
    }

    fn append_blob(
        shared: &HandlerShared,
        range: &BackupRange,
        blob: &[u8],
        sizes: &[u32],
        timestamps: &[u32],
    ) -> Result<()> {
        let _token = range.log.io_token().lock();
        let mut scratch = shared.pool.acquire()?;
        range
            .log
            .append(blob, sizes, timestamps, AppendTarget::Writer, &mut scratch)
    }

    /// Append the raw primary bytes to the circular primary log, then fan
    /// the converted entries into the range's staging buffer.
    fn append_via_primary(
        shared: &HandlerShared,
        range: &BackupRange,
        descriptors: &[BatchDescriptor],
    ) -> Result<()> {
        let mut assembly = shared.pool.acquire()?;
        let mut blob_len = 0usize;
        for descriptor in descriptors {
            let view = Self::entry_view(shared, descriptor);
            view.copy_to(
                0,
                &mut assembly.as_mut_slice()[blob_len..blob_len + descriptor.len as usize],
            );
            blob_len += descriptor.len as usize;
        }

        {
            let mut scratch = shared.pool.acquire()?;
            shared
                .primary
                .append(&assembly.as_slice()[..blob_len], &mut scratch)?;
        }
        shared.stats.primary_appends.fetch_add(1, Ordering::Relaxed);
        drop(assembly);

        let mut conv = shared.pool.acquire()?;
        for descriptor in descriptors {
            let view = Self::entry_view(shared, descriptor);
            let info = parse(Dialect::Primary, &view, &shared.codec, 0)?
                .ok_or_else(|| LogError::Corrupt("empty entry in write buffer".into()))?;
            let conv_size =
                convert_to_secondary(&view, descriptor.len as usize, conv.as_mut_slice());
            range.buffer.append_entry(
                &conv.as_slice()[..conv_size],
                info.timestamp,
                &range.log,
                &shared.pool,
            )?;
        }
        Ok(())
    }
}
