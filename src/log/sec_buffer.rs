//! Per-range staging buffer in front of the secondary log.
//!
//! Small converted entries are coalesced here until the buffer fills (or a
//! flush is forced), then written to the log in one page-aligned I/O. The
//! buffer tracks entry boundaries so the log can split the blob at segment
//! edges.

use parking_lot::Mutex;

use crate::buffer_pool::BufferPool;
use crate::error::Result;
use crate::log::secondary::{AppendTarget, SecondaryLog};
use crate::utility::AlignedBuffer;

struct SecBufferState {
    data: AlignedBuffer,
    len: usize,
    entry_sizes: Vec<u32>,
    timestamps: Vec<u32>,
}

/// Coalescing staging buffer for one secondary log.
pub struct SecondaryLogBuffer {
    capacity: usize,
    use_timestamps: bool,
    state: Mutex<SecBufferState>,
}

impl SecondaryLogBuffer {
    /// Create a buffer of `capacity` bytes, page-aligned for direct I/O.
    pub fn new(capacity: usize, page_size: usize, use_timestamps: bool) -> Self {
        Self {
            capacity,
            use_timestamps,
            state: Mutex::new(SecBufferState {
                data: AlignedBuffer::zeroed(page_size, capacity).expect("buffer allocation"),
                len: 0,
                entry_sizes: Vec::new(),
                timestamps: Vec::new(),
            }),
        }
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    /// Whether the buffer holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether appending `additional` bytes would overflow the buffer.
    pub fn would_overflow(&self, additional: usize) -> bool {
        self.len() + additional > self.capacity
    }

    /// Stage one secondary-format entry; flushes first when full. Entries
    /// larger than the buffer bypass it entirely.
    pub fn append_entry(
        &self,
        entry: &[u8],
        timestamp: u32,
        log: &SecondaryLog,
        pool: &BufferPool,
    ) -> Result<()> {
        if entry.len() > self.capacity {
            // Keep ordering: older staged entries go out first.
            self.flush(log, pool)?;
            let _token = log.io_token().lock();
            let mut scratch = pool.acquire()?;
            let ts = [timestamp];
            let timestamps: &[u32] = if self.use_timestamps { &ts } else { &[] };
            return log.append(
                entry,
                &[entry.len() as u32],
                timestamps,
                AppendTarget::Writer,
                &mut scratch,
            );
        }

        if self.would_overflow(entry.len()) {
            self.flush(log, pool)?;
        }

        let mut state = self.state.lock();
        let len = state.len;
        state.data.as_mut_slice()[len..len + entry.len()].copy_from_slice(entry);
        state.len += entry.len();
        state.entry_sizes.push(entry.len() as u32);
        if self.use_timestamps {
            state.timestamps.push(timestamp);
        }
        Ok(())
    }

    /// Write all staged entries to the log and reset the buffer.
    pub fn flush(&self, log: &SecondaryLog, pool: &BufferPool) -> Result<()> {
        let mut state = self.state.lock();
        if state.len == 0 {
            return Ok(());
        }

        let _token = log.io_token().lock();
        let mut scratch = pool.acquire()?;
        log.append(
            &state.data.as_slice()[..state.len],
            &state.entry_sizes,
            &state.timestamps,
            AppendTarget::Writer,
            &mut scratch,
        )?;

        state.len = 0;
        state.entry_sizes.clear();
        state.timestamps.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CodecConfig;
    use crate::device::BufferedFile;
    use crate::ids::RangeKey;
    use tempfile::tempdir;

    fn setup() -> (SecondaryLogBuffer, SecondaryLog, BufferPool, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let codec = CodecConfig {
            segment_size: 64 * 1024,
            flash_page_size: 4096,
            timestamp_size: 0,
            checksum_size: 0,
        };
        let device = BufferedFile::open(dir.path().join("0001_0000.sec"), 256 * 1024).unwrap();
        let log = SecondaryLog::new(RangeKey::new(1, 0), Box::new(device), codec);
        let pool = BufferPool::new(64 * 1024 + 4096, 4096, 2);
        let buffer = SecondaryLogBuffer::new(8 * 1024, 4096, false);
        (buffer, log, pool, dir)
    }

    #[test]
    fn test_coalesces_until_flush() {
        let (buffer, log, pool, _dir) = setup();

        buffer.append_entry(&[1u8; 100], 0, &log, &pool).unwrap();
        buffer.append_entry(&[2u8; 100], 0, &log, &pool).unwrap();
        assert_eq!(buffer.len(), 200);
        assert_eq!(log.used_bytes(), 0);

        buffer.flush(&log, &pool).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(log.used_bytes(), 200);

        let mut out = pool.acquire().unwrap();
        let used = log.read_segment(0, out.as_mut_slice()).unwrap();
        assert_eq!(used, 200);
        assert_eq!(&out.as_slice()[..100], &[1u8; 100][..]);
        assert_eq!(&out.as_slice()[100..200], &[2u8; 100][..]);
    }

    #[test]
    fn test_overflow_triggers_flush() {
        let (buffer, log, pool, _dir) = setup();

        buffer.append_entry(&[1u8; 6000], 0, &log, &pool).unwrap();
        // 6000 + 4000 > 8192: the first entry must be flushed out first.
        buffer.append_entry(&[2u8; 4000], 0, &log, &pool).unwrap();

        assert_eq!(buffer.len(), 4000);
        assert_eq!(log.used_bytes(), 6000);
    }

    #[test]
    fn test_oversized_entry_bypasses_buffer() {
        let (buffer, log, pool, _dir) = setup();

        buffer.append_entry(&[1u8; 100], 0, &log, &pool).unwrap();
        buffer.append_entry(&[2u8; 20 * 1024], 0, &log, &pool).unwrap();

        // Staged entry flushed first, oversized entry written directly.
        assert!(buffer.is_empty());
        assert_eq!(log.used_bytes(), 100 + 20 * 1024);
    }

    #[test]
    fn test_flush_empty_is_noop() {
        let (buffer, log, pool, _dir) = setup();
        buffer.flush(&log, &pool).unwrap();
        assert_eq!(log.used_bytes(), 0);
    }
}
