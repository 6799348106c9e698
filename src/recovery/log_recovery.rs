//! Parallel recovery of a registered backup range.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::buffer_pool::BufferPool;
use crate::catalog::{BackupRange, BackupRangeCatalog};
use crate::config::CodecConfig;
use crate::error::{LogError, Result};
use crate::header::{parse, verify_checksum, Dialect, RingView};
use crate::ids::{ChunkId, RangeKey, Version};
use crate::recovery::{RecoveredChunk, RecoveryMetadata, RecoverySink};

/// Chunks handed to the sink per call, to amortize contention.
const HANDOFF_BATCH: usize = 64;

struct ChainSlot {
    version: Version,
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
}

#[derive(Default)]
struct MetadataAcc {
    chunks: u64,
    bytes: u64,
    first_cid: Option<ChunkId>,
    last_cid: Option<ChunkId>,
    checksum_errors: u64,
    corrupt_segments: u64,
}

struct RecoveryShared<'a> {
    range: &'a BackupRange,
    codec: CodecConfig,
    sink: &'a dyn RecoverySink,
    next_segment: AtomicUsize,
    segment_count: usize,
    chains: Mutex<HashMap<ChunkId, ChainSlot>>,
    emitted: Mutex<HashMap<ChunkId, Version>>,
    acc: Mutex<MetadataAcc>,
    failure: Mutex<Option<LogError>>,
}

/// Recovers registered backup ranges by scanning their secondary logs.
pub struct LogRecoveryHandler {
    catalog: Arc<BackupRangeCatalog>,
    pool: BufferPool,
    codec: CodecConfig,
}

impl LogRecoveryHandler {
    /// Create the handler.
    pub fn new(catalog: Arc<BackupRangeCatalog>, pool: BufferPool, codec: CodecConfig) -> Self {
        Self {
            catalog,
            pool,
            codec,
        }
    }

    /// Recover every surviving chunk of `(owner, range)` into `sink`.
    ///
    /// Scans all segments with one worker per core (capped by the segment
    /// count), resolves versions against the range's version store and
    /// reassembles chains. A corrupted segment aborts only that segment.
    pub fn recover_backup_range(
        &self,
        key: RangeKey,
        sink: &dyn RecoverySink,
    ) -> Result<RecoveryMetadata> {
        let range = self.catalog.get(key).ok_or(LogError::RangeNotFound {
            owner: key.owner,
            range_id: key.range_id,
        })?;

        // Everything staged in memory must be on disk before the scan.
        range.buffer.flush(&range.log, &self.pool)?;
        range.versions.flush()?;

        let start = Instant::now();
        let segment_count = range.log.segment_count();
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(segment_count)
            .max(1);

        let shared = RecoveryShared {
            range: &range,
            codec: self.codec,
            sink,
            next_segment: AtomicUsize::new(0),
            segment_count,
            chains: Mutex::new(HashMap::new()),
            emitted: Mutex::new(HashMap::new()),
            acc: Mutex::new(MetadataAcc::default()),
            failure: Mutex::new(None),
        };

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| Self::worker(&shared, &self.pool));
            }
        });

        if let Some(error) = shared.failure.into_inner() {
            return Err(error);
        }

        // Chains that never completed are dropped with a warning.
        let dangling: u64 = shared
            .chains
            .into_inner()
            .values()
            .map(|slot| slot.received as u64)
            .sum();
        if dangling > 0 {
            tracing::warn!(range = %key, parts = dangling,
                "incomplete chains discarded at end of recovery");
        }

        let acc = shared.acc.into_inner();
        let metadata = RecoveryMetadata {
            chunks: acc.chunks,
            bytes: acc.bytes,
            first_cid: acc.first_cid,
            last_cid: acc.last_cid,
            checksum_errors: acc.checksum_errors,
            corrupt_segments: acc.corrupt_segments,
            dangling_chain_parts: dangling,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        tracing::info!(range = %key, chunks = metadata.chunks, bytes = metadata.bytes,
            duration_ms = metadata.duration_ms, "backup range recovered");
        Ok(metadata)
    }

    fn worker(shared: &RecoveryShared<'_>, pool: &BufferPool) {
        let mut batch: Vec<RecoveredChunk> = Vec::with_capacity(HANDOFF_BATCH);

        loop {
            if shared.failure.lock().is_some() {
                return;
            }
            let segment = shared.next_segment.fetch_add(1, Ordering::SeqCst);
            if segment >= shared.segment_count {
                break;
            }
            if let Err(error) = Self::process_segment(shared, pool, segment, &mut batch) {
                *shared.failure.lock() = Some(error);
                return;
            }
        }

        if !batch.is_empty() {
            if let Err(error) = Self::deliver(shared, &mut batch) {
                *shared.failure.lock() = Some(error);
            }
        }
    }

    fn process_segment(
        shared: &RecoveryShared<'_>,
        pool: &BufferPool,
        segment: usize,
        batch: &mut Vec<RecoveredChunk>,
    ) -> Result<()> {
        let mut buf = pool.acquire()?;
        // Full segment scan: in-memory metadata does not survive a restart,
        // the zero fill terminates the walk instead.
        let limit = shared.range.log.read_segment_raw(segment, buf.as_mut_slice())?;
        let data = &buf.as_slice()[..limit];

        let mut offset = 0usize;
        while offset < limit {
            let view = RingView::contiguous(data, offset);
            let info = match parse(
                Dialect::Secondary,
                &view,
                &shared.codec,
                shared.range.original_owner,
            ) {
                Ok(Some(info)) => info,
                Ok(None) => break,
                Err(error) => {
                    // Torn tail or stale bytes; drop the rest of the segment.
                    tracing::warn!(segment, offset, %error, "segment scan stopped");
                    shared.acc.lock().corrupt_segments += 1;
                    break;
                }
            };

            let size = info.entry_size();
            if offset + size > limit {
                tracing::warn!(segment, offset, "truncated trailing entry, segment scan stopped");
                shared.acc.lock().corrupt_segments += 1;
                break;
            }

            if !verify_checksum(&view, &info) {
                shared.acc.lock().checksum_errors += 1;
                offset += size;
                continue;
            }

            let current = shared.range.versions.get_current(info.cid);
            if info.version < current {
                offset += size;
                continue;
            }

            let payload = &data[offset + info.header_size()..offset + size];
            match info.chain {
                None => batch.push(RecoveredChunk {
                    cid: info.cid,
                    version: info.version,
                    payload: payload.to_vec(),
                }),
                Some(chain) => {
                    if let Some(chunk) =
                        Self::stage_chain_part(shared, info.cid, info.version, chain, payload)
                    {
                        batch.push(chunk);
                    }
                }
            }

            if batch.len() >= HANDOFF_BATCH {
                Self::deliver(shared, batch)?;
            }
            offset += size;
        }

        Ok(())
    }

    /// Store one chain part; returns the whole chunk when the chain is
    /// complete.
    fn stage_chain_part(
        shared: &RecoveryShared<'_>,
        cid: ChunkId,
        version: Version,
        chain: crate::header::ChainInfo,
        payload: &[u8],
    ) -> Option<RecoveredChunk> {
        let mut chains = shared.chains.lock();
        let slot = chains.entry(cid).or_insert_with(|| ChainSlot {
            version,
            parts: vec![None; chain.count as usize],
            received: 0,
        });

        if version > slot.version {
            // Parts of an older, superseded chain; restart the slot.
            *slot = ChainSlot {
                version,
                parts: vec![None; chain.count as usize],
                received: 0,
            };
        } else if version < slot.version {
            return None;
        }

        let index = chain.index as usize;
        if index >= slot.parts.len() {
            return None;
        }
        if slot.parts[index].is_none() {
            slot.received += 1;
        }
        slot.parts[index] = Some(payload.to_vec());

        if slot.received < slot.parts.len() {
            return None;
        }

        let slot = chains.remove(&cid).expect("slot present");
        let mut assembled = Vec::new();
        for part in slot.parts {
            assembled.extend_from_slice(&part.expect("complete chain"));
        }
        Some(RecoveredChunk {
            cid,
            version: slot.version,
            payload: assembled,
        })
    }

    /// Hand a batch to the sink, deduplicating against chunks already
    /// delivered (possibly by another worker).
    fn deliver(shared: &RecoveryShared<'_>, batch: &mut Vec<RecoveredChunk>) -> Result<()> {
        let mut kept = Vec::with_capacity(batch.len());
        {
            let mut emitted = shared.emitted.lock();
            for chunk in batch.drain(..) {
                match emitted.get(&chunk.cid) {
                    Some(version) if *version >= chunk.version => continue,
                    _ => {
                        emitted.insert(chunk.cid, chunk.version);
                        kept.push(chunk);
                    }
                }
            }
        }
        if kept.is_empty() {
            return Ok(());
        }

        {
            let mut acc = shared.acc.lock();
            for chunk in &kept {
                acc.chunks += 1;
                acc.bytes += chunk.payload.len() as u64;
                acc.first_cid = Some(match acc.first_cid {
                    Some(first) => first.min(chunk.cid),
                    None => chunk.cid,
                });
                acc.last_cid = Some(match acc.last_cid {
                    Some(last) => last.max(chunk.cid),
                    None => chunk.cid,
                });
            }
        }

        shared.sink.create_and_put_recovered(&kept)
    }
}
