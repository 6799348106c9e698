//! Live reorganization under an update-heavy workload.

mod common;

use std::time::Duration;

use common::{log_uniform_chunks, small_config};
use oxilog::{CollectingSink, LogStore};
use tempfile::tempdir;

#[test]
fn test_reorg_reclaims_and_preserves_liveness() {
    let dir = tempdir().unwrap();
    let mut config = small_config(dir.path());
    config.utilization_activate_reorganization = 10;
    let store = LogStore::open(config).unwrap();
    store.init_backup_range(0, 2).unwrap();

    // Write every chunk once, then update it five times; the final round
    // writes 0x07.
    let rounds: [u8; 6] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x07];
    for byte in rounds {
        log_uniform_chunks(&store, 2, 0, 1, 3000, byte, 250);
    }
    store.flush().unwrap();

    // Let the reorganizer quiesce below the activation threshold.
    std::thread::sleep(Duration::from_secs(3));

    assert!(
        store.stats().reorg_passes.load(std::sync::atomic::Ordering::Relaxed) > 0,
        "reorganization must have run"
    );
    assert!(
        store
            .stats()
            .bytes_reclaimed
            .load(std::sync::atomic::Ordering::Relaxed)
            > 0,
        "obsolete versions must have been reclaimed"
    );

    let sink = CollectingSink::new();
    let metadata = store.recover_backup_range(2, 0, &sink).unwrap();
    assert_eq!(metadata.chunks, 3000, "every live chunk survives reorganization");

    for chunk in sink.into_chunks() {
        assert_eq!(chunk.payload.len(), 64);
        assert!(
            chunk.payload.iter().all(|&b| b == 0x07),
            "recovery must see the final update only"
        );
    }

    store.close().unwrap();
}

#[test]
fn test_reorg_idle_when_below_threshold() {
    let dir = tempdir().unwrap();
    let mut config = small_config(dir.path());
    config.utilization_activate_reorganization = 90;
    let store = LogStore::open(config).unwrap();
    store.init_backup_range(0, 2).unwrap();

    log_uniform_chunks(&store, 2, 0, 1, 500, 0x05, 100);
    store.flush().unwrap();
    std::thread::sleep(Duration::from_millis(1200));

    assert_eq!(
        store.stats().reorg_passes.load(std::sync::atomic::Ordering::Relaxed),
        0,
        "no reorganization below the activation threshold"
    );

    store.close().unwrap();
}
