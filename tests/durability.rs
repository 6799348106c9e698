//! Durability across clean shutdown and restart.

mod common;

use common::{log_uniform_chunks, small_config};
use oxilog::{ChunkId, CollectingSink, LogStore, Version};
use tempfile::tempdir;

#[test]
fn test_recover_after_clean_shutdown() {
    let dir = tempdir().unwrap();

    {
        let store = LogStore::open(small_config(dir.path())).unwrap();
        store.init_backup_range(0, 2).unwrap();
        log_uniform_chunks(&store, 2, 0, 1, 500, 0x05, 100);
        // Update a subset so recovery must pick versions, not just presence.
        log_uniform_chunks(&store, 2, 0, 1, 100, 0x09, 100);
        store.close().unwrap();
    }

    let store = LogStore::open(small_config(dir.path())).unwrap();
    store.init_backup_range(0, 2).unwrap();

    let sink = CollectingSink::new();
    let metadata = store.recover_backup_range(2, 0, &sink).unwrap();
    assert_eq!(metadata.chunks, 500);

    let mut chunks = sink.into_chunks();
    chunks.sort_by_key(|c| c.cid);
    for chunk in &chunks {
        let expected = if chunk.cid.local_id() <= 100 { 0x09 } else { 0x05 };
        assert!(chunk.payload.iter().all(|&b| b == expected));
        assert!(chunk.version >= Version::new(0, 1));
    }

    store.close().unwrap();
}

#[test]
fn test_close_is_idempotent() {
    let dir = tempdir().unwrap();
    let store = LogStore::open(small_config(dir.path())).unwrap();
    store.init_backup_range(0, 2).unwrap();
    log_uniform_chunks(&store, 2, 0, 1, 10, 0x05, 10);

    store.close().unwrap();
    store.close().unwrap();

    // Operations after close fail with Shutdown.
    assert!(matches!(
        store.init_backup_range(1, 2),
        Err(oxilog::LogError::Shutdown)
    ));
}

#[test]
fn test_recover_from_standalone_file() {
    let dir = tempdir().unwrap();

    {
        let store = LogStore::open(small_config(dir.path())).unwrap();
        store.init_backup_range(0, 2).unwrap();
        log_uniform_chunks(&store, 2, 0, 1, 50, 0x05, 25);
        log_uniform_chunks(&store, 2, 0, 1, 10, 0x08, 10);
        store.close().unwrap();
    }

    // A second engine, pointed elsewhere, reads the bare file.
    let other = tempdir().unwrap();
    let store = LogStore::open(small_config(other.path())).unwrap();
    let (metadata, chunks) = store
        .recover_backup_range_from_file(dir.path().join("0002_0000.sec"))
        .unwrap();

    assert_eq!(metadata.chunks, 50);
    assert_eq!(chunks.len(), 50);
    for chunk in &chunks {
        let expected = if chunk.cid.local_id() <= 10 { 0x08 } else { 0x05 };
        assert!(chunk.payload.iter().all(|&b| b == expected));
    }

    store.close().unwrap();
}

#[test]
fn test_init_recovered_backup_range_takes_over_files() {
    let dir = tempdir().unwrap();

    {
        let store = LogStore::open(small_config(dir.path())).unwrap();
        store.init_backup_range(0, 2).unwrap();
        log_uniform_chunks(&store, 2, 0, 1, 30, 0x05, 30);
        store.close().unwrap();
    }

    let store = LogStore::open(small_config(dir.path())).unwrap();
    assert!(store
        .init_recovered_backup_range(4, 3, 0, 2, false)
        .unwrap());
    assert!(dir.path().join("0003_0004.sec").exists());

    let sink = CollectingSink::new();
    let metadata = store.recover_backup_range(3, 4, &sink).unwrap();
    assert_eq!(metadata.chunks, 30);
    // Chunk identities are unchanged by the takeover.
    assert_eq!(metadata.first_cid, Some(ChunkId::new(2, 1)));

    store.close().unwrap();
}

#[test]
fn test_purge_on_start() {
    let dir = tempdir().unwrap();

    {
        let store = LogStore::open(small_config(dir.path())).unwrap();
        store.init_backup_range(0, 2).unwrap();
        log_uniform_chunks(&store, 2, 0, 1, 10, 0x05, 10);
        store.close().unwrap();
    }
    assert!(dir.path().join("0002_0000.sec").exists());

    let mut config = small_config(dir.path());
    config.purge_on_start = true;
    let store = LogStore::open(config).unwrap();
    assert!(!dir.path().join("0002_0000.sec").exists());
    store.close().unwrap();
}
