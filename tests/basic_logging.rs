//! Log-then-recover round trips on one range.

mod common;

use common::{cid, encode_batch, log_uniform_chunks, small_config};
use oxilog::{ChunkId, CollectingSink, LogStore};
use tempfile::tempdir;

#[test]
fn test_log_and_recover_thousand_chunks() {
    let dir = tempdir().unwrap();
    let store = LogStore::open(small_config(dir.path())).unwrap();

    assert!(store.init_backup_range(0, 2).unwrap());
    log_uniform_chunks(&store, 2, 0, 1, 1000, 0x05, 100);

    let sink = CollectingSink::new();
    let metadata = store.recover_backup_range(2, 0, &sink).unwrap();

    assert_eq!(metadata.chunks, 1000);
    assert_eq!(metadata.bytes, 1000 * 64);
    assert_eq!(metadata.checksum_errors, 0);
    assert_eq!(metadata.first_cid, Some(ChunkId::new(2, 1)));
    assert_eq!(metadata.last_cid, Some(ChunkId::new(2, 0x3E8)));

    let mut chunks = sink.into_chunks();
    assert_eq!(chunks.len(), 1000);
    chunks.sort_by_key(|c| c.cid);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.cid, ChunkId::new(2, i as u64 + 1));
        assert_eq!(chunk.payload.len(), 64);
        assert!(chunk.payload.iter().all(|&b| b == 0x05));
    }

    store.close().unwrap();
}

#[test]
fn test_updates_recover_at_latest_version() {
    let dir = tempdir().unwrap();
    let store = LogStore::open(small_config(dir.path())).unwrap();
    store.init_backup_range(0, 2).unwrap();

    for round in 0u8..4 {
        log_uniform_chunks(&store, 2, 0, 1, 100, round, 50);
    }

    let sink = CollectingSink::new();
    let metadata = store.recover_backup_range(2, 0, &sink).unwrap();
    assert_eq!(metadata.chunks, 100);

    for chunk in sink.into_chunks() {
        assert!(chunk.payload.iter().all(|&b| b == 3), "latest round wins");
    }

    store.close().unwrap();
}

#[test]
fn test_unknown_range_is_rejected() {
    let dir = tempdir().unwrap();
    let store = LogStore::open(small_config(dir.path())).unwrap();

    let batch = encode_batch(&[(cid(2, 1), vec![0u8; 16])]);
    let result = store.log_chunks(2, 9, 1, &batch);
    assert!(matches!(
        result,
        Err(oxilog::LogError::RangeNotFound { owner: 2, range_id: 9 })
    ));

    store.close().unwrap();
}

#[test]
fn test_double_init_returns_false() {
    let dir = tempdir().unwrap();
    let store = LogStore::open(small_config(dir.path())).unwrap();

    assert!(store.init_backup_range(0, 2).unwrap());
    assert!(!store.init_backup_range(0, 2).unwrap());

    store.close().unwrap();
}

#[test]
fn test_timestamps_enabled_roundtrip() {
    let dir = tempdir().unwrap();
    let mut config = small_config(dir.path());
    config.use_timestamps = true;
    let store = LogStore::open(config).unwrap();

    store.init_backup_range(0, 2).unwrap();
    log_uniform_chunks(&store, 2, 0, 1, 200, 0x11, 40);

    let sink = CollectingSink::new();
    let metadata = store.recover_backup_range(2, 0, &sink).unwrap();
    assert_eq!(metadata.chunks, 200);

    store.close().unwrap();
}

#[test]
fn test_utilization_report_mentions_ranges() {
    let dir = tempdir().unwrap();
    let store = LogStore::open(small_config(dir.path())).unwrap();

    store.init_backup_range(0, 2).unwrap();
    store.init_backup_range(1, 2).unwrap();
    log_uniform_chunks(&store, 2, 0, 1, 100, 1, 100);
    store.flush().unwrap();

    let report = store.current_utilization();
    assert!(report.contains("Primary log:"));
    assert!(report.contains("0002_0000"));
    assert!(report.contains("0002_0001"));

    store.close().unwrap();
}
