//! Engine counters.
//!
//! Plain atomic counters shared across the workers; rendered by
//! `LogStore::current_utilization` and available to callers for test
//! assertions and monitoring.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::ErrorKind;

/// Counters maintained by the engine.
#[derive(Default)]
pub struct EngineStats {
    errors: [AtomicU64; ErrorKind::COUNT],
    /// Chunks accepted by `log_chunks`.
    pub chunks_logged: AtomicU64,
    /// Payload bytes accepted by `log_chunks`.
    pub bytes_logged: AtomicU64,
    /// Batches appended to the primary log.
    pub primary_appends: AtomicU64,
    /// Sub-streams flushed directly to a secondary log.
    pub direct_flushes: AtomicU64,
    /// Completed reorganization segment passes.
    pub reorg_passes: AtomicU64,
    /// Segments freed by reorganization.
    pub segments_freed: AtomicU64,
    /// Bytes reclaimed by reorganization.
    pub bytes_reclaimed: AtomicU64,
}

impl EngineStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one error of the given kind.
    pub fn record_error(&self, kind: ErrorKind) {
        self.errors[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Count `n` errors of the given kind at once.
    pub fn record_errors(&self, kind: ErrorKind, n: u64) {
        if n > 0 {
            self.errors[kind as usize].fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Current count for one error kind.
    pub fn error_count(&self, kind: ErrorKind) -> u64 {
        self.errors[kind as usize].load(Ordering::Relaxed)
    }

    /// Render the non-zero error counters.
    pub fn error_summary(&self) -> String {
        let kinds = [
            ErrorKind::InvalidConfig,
            ErrorKind::Io,
            ErrorKind::ChecksumMismatch,
            ErrorKind::BufferFull,
            ErrorKind::RangeNotFound,
            ErrorKind::Corrupt,
            ErrorKind::Shutdown,
        ];
        let mut parts = Vec::new();
        for kind in kinds {
            let count = self.error_count(kind);
            if count > 0 {
                parts.push(format!("{}={count}", kind.as_str()));
            }
        }
        if parts.is_empty() {
            "none".to_string()
        } else {
            parts.join(", ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_counters() {
        let stats = EngineStats::new();
        assert_eq!(stats.error_count(ErrorKind::Io), 0);

        stats.record_error(ErrorKind::Io);
        stats.record_error(ErrorKind::Io);
        stats.record_error(ErrorKind::ChecksumMismatch);

        assert_eq!(stats.error_count(ErrorKind::Io), 2);
        assert_eq!(stats.error_count(ErrorKind::ChecksumMismatch), 1);

        let summary = stats.error_summary();
        assert!(summary.contains("IoError=2"));
        assert!(summary.contains("ChecksumMismatch=1"));
    }

    #[test]
    fn test_empty_summary() {
        let stats = EngineStats::new();
        assert_eq!(stats.error_summary(), "none");
    }
}
