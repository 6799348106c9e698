//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::path::Path;

use oxilog::{ChunkId, StoreConfig};

/// Small-geometry configuration: 4 KiB pages, 1 MiB segments, 4 MiB primary
/// log, 2 MiB write buffer, checksums on, timestamps off.
pub fn small_config(dir: &Path) -> StoreConfig {
    StoreConfig {
        backup_directory: dir.to_path_buf(),
        node_id: 2,
        flash_page_size: 4096,
        log_segment_size: 1 << 20,
        primary_log_size: 4 << 20,
        secondary_log_size: 8 << 20,
        write_buffer_size: 2 << 20,
        secondary_log_buffer_size: 128 << 10,
        use_checksums: true,
        use_timestamps: false,
        ..StoreConfig::default()
    }
}

/// Encode a caller batch: `cid | len | payload` per entry.
pub fn encode_batch(entries: &[(u64, Vec<u8>)]) -> Vec<u8> {
    let mut batch = Vec::new();
    for (cid, payload) in entries {
        batch.extend_from_slice(&cid.to_le_bytes());
        batch.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        batch.extend_from_slice(payload);
    }
    batch
}

/// Build a chunk id the way the caller does.
pub fn cid(owner: u16, local_id: u64) -> u64 {
    ChunkId::new(owner, local_id).raw()
}

/// Log `count` chunks of `payload_byte` (64 bytes each), `batch_size` per
/// call, with local ids starting at `first_lid`.
pub fn log_uniform_chunks(
    store: &oxilog::LogStore,
    owner: u16,
    range_id: u16,
    first_lid: u64,
    count: u64,
    payload_byte: u8,
    batch_size: u64,
) {
    let mut lid = first_lid;
    while lid < first_lid + count {
        let n = batch_size.min(first_lid + count - lid);
        let entries: Vec<(u64, Vec<u8>)> = (lid..lid + n)
            .map(|l| (cid(owner, l), vec![payload_byte; 64]))
            .collect();
        store
            .log_chunks(owner, range_id, n as u32, &encode_batch(&entries))
            .unwrap();
        lid += n;
    }
}
