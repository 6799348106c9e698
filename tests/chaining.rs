//! Large chunks split into chains and reassembled on recovery.

mod common;

use common::{cid, encode_batch, small_config};
use oxilog::{CollectingSink, LogStore};
use tempfile::tempdir;

#[test]
fn test_twelve_mib_chunk_roundtrip() {
    let dir = tempdir().unwrap();
    let mut config = small_config(dir.path());
    config.secondary_log_size = 32 << 20;
    let store = LogStore::open(config).unwrap();
    store.init_backup_range(0, 2).unwrap();

    // 12 MiB with 1 MiB segments: thirteen chain parts.
    let payload: Vec<u8> = (0..12 << 20).map(|i| (i % 251) as u8).collect();
    let batch = encode_batch(&[(cid(2, 42), payload.clone())]);
    store.log_chunks(2, 0, 1, &batch).unwrap();

    let sink = CollectingSink::new();
    let metadata = store.recover_backup_range(2, 0, &sink).unwrap();
    assert_eq!(metadata.chunks, 1);
    assert_eq!(metadata.bytes, 12 << 20);
    assert_eq!(metadata.dangling_chain_parts, 0);

    let chunks = sink.into_chunks();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].payload.len(), 12 << 20);
    assert_eq!(chunks[0].payload, payload, "parts concatenate in chain order");

    store.close().unwrap();
}

#[test]
fn test_chained_and_small_chunks_mix() {
    let dir = tempdir().unwrap();
    let mut config = small_config(dir.path());
    config.secondary_log_size = 16 << 20;
    let store = LogStore::open(config).unwrap();
    store.init_backup_range(0, 2).unwrap();

    let big: Vec<u8> = vec![0xAB; 3 << 20];
    store
        .log_chunks(2, 0, 1, &encode_batch(&[(cid(2, 1), big.clone())]))
        .unwrap();
    store
        .log_chunks(
            2,
            0,
            2,
            &encode_batch(&[(cid(2, 2), vec![0x01; 64]), (cid(2, 3), vec![0x02; 64])]),
        )
        .unwrap();

    let sink = CollectingSink::new();
    let metadata = store.recover_backup_range(2, 0, &sink).unwrap();
    assert_eq!(metadata.chunks, 3);

    let mut chunks = sink.into_chunks();
    chunks.sort_by_key(|c| c.cid);
    assert_eq!(chunks[0].payload, big);
    assert_eq!(chunks[1].payload, vec![0x01; 64]);
    assert_eq!(chunks[2].payload, vec![0x02; 64]);

    store.close().unwrap();
}

#[test]
fn test_updated_chain_recovers_latest() {
    let dir = tempdir().unwrap();
    let mut config = small_config(dir.path());
    config.secondary_log_size = 32 << 20;
    let store = LogStore::open(config).unwrap();
    store.init_backup_range(0, 2).unwrap();

    let old: Vec<u8> = vec![0x01; 2 << 20];
    let new: Vec<u8> = vec![0x02; 2 << 20];
    store
        .log_chunks(2, 0, 1, &encode_batch(&[(cid(2, 9), old)]))
        .unwrap();
    store
        .log_chunks(2, 0, 1, &encode_batch(&[(cid(2, 9), new.clone())]))
        .unwrap();

    let sink = CollectingSink::new();
    let metadata = store.recover_backup_range(2, 0, &sink).unwrap();
    assert_eq!(metadata.chunks, 1);

    let chunks = sink.into_chunks();
    assert_eq!(chunks[0].payload, new);

    store.close().unwrap();
}
